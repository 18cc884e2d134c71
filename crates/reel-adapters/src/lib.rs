//! Page extractor for the reference database: URL templates and HTML fragment extraction.

use std::fmt;
use std::sync::LazyLock;

use reel_core::{Character, Companies, Company, Crew, CrewMember, Department, CAST_DEPARTMENT};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "reel-adapters";

static TITLE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/title/(tt\d+)").expect("valid title id pattern"));
static NAME_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"name/(nm\d+)").expect("valid name id pattern"));
static CHARACTER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"nm\d+").expect("valid character id pattern"));
static COMPANY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/company/(co\d+)").expect("valid company id pattern"));
static HOURS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)h").expect("valid hours pattern"));
static MINUTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)m").expect("valid minutes pattern"));
static ORDINAL_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\s+").expect("valid ordinal pattern"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("expected page structure missing: {0}")]
    MissingStructure(&'static str),
}

/// The four per-identifier pages fetched during enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailPage {
    Details,
    Ratings,
    Crew,
    Companies,
}

impl DetailPage {
    pub const ALL: [DetailPage; 4] = [
        DetailPage::Details,
        DetailPage::Ratings,
        DetailPage::Crew,
        DetailPage::Companies,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DetailPage::Details => "details",
            DetailPage::Ratings => "ratings",
            DetailPage::Crew => "crew",
            DetailPage::Companies => "companies",
        }
    }
}

impl fmt::Display for DetailPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URL templates. `{title}` is replaced with the percent-encoded title, `{id}`
/// with the external identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceEndpoints {
    pub search: String,
    pub details: String,
    pub ratings: String,
    pub crew: String,
    pub companies: String,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        Self {
            search: "https://www.imdb.com/search/title/?title={title}".to_string(),
            details: "https://www.imdb.com/title/{id}/".to_string(),
            ratings: "https://www.imdb.com/title/{id}/ratings/".to_string(),
            crew: "https://www.imdb.com/title/{id}/fullcredits/".to_string(),
            companies: "https://www.imdb.com/title/{id}/companycredits/".to_string(),
        }
    }
}

impl SourceEndpoints {
    pub fn search_url(&self, title: &str) -> String {
        self.search.replace("{title}", &urlencoding::encode(title))
    }

    pub fn page_url(&self, page: DetailPage, external_id: &str) -> String {
        let template = match page {
            DetailPage::Details => &self.details,
            DetailPage::Ratings => &self.ratings,
            DetailPage::Crew => &self.crew,
            DetailPage::Companies => &self.companies,
        };
        template.replace("{id}", external_id)
    }
}

/// First search hit as shown on the results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCandidate {
    pub external_id: String,
    pub title: String,
    pub release_year: Option<String>,
    pub runtime_text: String,
    pub runtime_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailsFragment {
    pub description: Option<String>,
    pub genres: Vec<String>,
    pub image_url: Option<String>,
    pub popularity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RatingsFragment {
    pub avg_rating: Option<String>,
    pub num_ratings: Option<String>,
}

/// `"2h 15m"` -> 8100. Missing components count as zero; absurd values saturate.
pub fn parse_runtime_to_seconds(text: &str) -> u64 {
    captured_number(&HOURS, text)
        .saturating_mul(3600)
        .saturating_add(captured_number(&MINUTES, text).saturating_mul(60))
}

fn captured_number(re: &Regex, text: &str) -> u64 {
    capture(re, text)
        .and_then(|digits| digits.parse::<u64>().ok())
        .unwrap_or(0)
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector(format!("{css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(el.text().collect::<String>())
}

fn select_first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).next().and_then(element_text))
}

fn select_first_attr(scope: ElementRef<'_>, css: &str, attr: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn select_all_texts(scope: ElementRef<'_>, css: &str) -> Result<Vec<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).filter_map(element_text).collect())
}

/// First selector in `candidates` that yields text wins.
fn first_text_of(scope: ElementRef<'_>, candidates: &[&str]) -> Result<Option<String>, ExtractError> {
    for css in candidates {
        if let Some(text) = select_first_text(scope, css)? {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn capitalize(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `Ok(None)` when the page has no result list or the first hit has no title link.
pub fn extract_search_candidate(html: &str) -> Result<Option<SearchCandidate>, ExtractError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let list_sel = selector("ul.ipc-metadata-list")?;
    let item_sel = selector("li")?;
    let Some(first_item) = root
        .select(&list_sel)
        .next()
        .and_then(|list| list.select(&item_sel).next())
    else {
        return Ok(None);
    };

    let link_sel = selector("a.ipc-title-link-wrapper")?;
    let Some(link) = first_item.select(&link_sel).next() else {
        return Ok(None);
    };
    let Some(external_id) = link.value().attr("href").and_then(|href| capture(&TITLE_ID, href)) else {
        return Ok(None);
    };

    let raw_title = select_first_text(link, "h3")?
        .or_else(|| element_text(link))
        .unwrap_or_default();
    let title = ORDINAL_PREFIX.replace(&raw_title, "").trim().to_string();

    let metadata = select_all_texts(first_item, ".dli-title-metadata span.dli-title-metadata-item")?;
    let release_year = metadata.first().cloned();
    let runtime_text = metadata.get(1).cloned().unwrap_or_default();

    Ok(Some(SearchCandidate {
        external_id,
        title,
        release_year,
        runtime_seconds: parse_runtime_to_seconds(&runtime_text),
        runtime_text,
    }))
}

const DESCRIPTION_SELECTORS: [&str; 2] = ["p.sc-cafe919b-3", "p[data-testid='plot']"];
const GENRE_SELECTORS: [&str; 2] = [
    ".sc-1f50b7c-4 div.ipc-chip-list__scroller span",
    "div[data-testid='genres'] div.ipc-chip-list__scroller span",
];
const POSTER_SELECTOR: &str = ".ipc-media--poster-l img";
const POPULARITY_SELECTORS: [&str; 2] = [
    "div.sc-5f7fb5b4-1",
    "div[data-testid='hero-rating-bar__popularity__score']",
];
const AVG_RATING_SELECTOR: &str = "span.sc-5931bdee-1";
const NUM_RATINGS_SELECTOR: &str = "div.sc-5931bdee-3";

pub fn extract_details(html: &str) -> Result<DetailsFragment, ExtractError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut genres = Vec::new();
    for css in GENRE_SELECTORS {
        genres = select_all_texts(root, css)?;
        if !genres.is_empty() {
            break;
        }
    }

    let details = DetailsFragment {
        description: first_text_of(root, &DESCRIPTION_SELECTORS)?,
        genres,
        image_url: select_first_attr(root, POSTER_SELECTOR, "src")?,
        popularity: first_text_of(root, &POPULARITY_SELECTORS)?,
    };

    if details == DetailsFragment::default() {
        return Err(ExtractError::MissingStructure("title details"));
    }
    Ok(details)
}

pub fn extract_ratings(html: &str) -> Result<RatingsFragment, ExtractError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let ratings = RatingsFragment {
        avg_rating: select_first_text(root, AVG_RATING_SELECTOR)?,
        num_ratings: select_first_text(root, NUM_RATINGS_SELECTOR)?,
    };
    if ratings == RatingsFragment::default() {
        return Err(ExtractError::MissingStructure("ratings summary"));
    }
    Ok(ratings)
}

const CAST_TABLE_SELECTOR: &str = "#fullcredits_content > table.cast_list";

/// Cast table first (rows need a linked name and at least one character),
/// then one department per `h4[id]` heading whose next sibling is a credits table.
pub fn extract_crew(html: &str) -> Result<Crew, ExtractError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let cast_sel = selector(CAST_TABLE_SELECTOR)?;
    let heading_sel = selector("h4[id]")?;

    let cast_table = root.select(&cast_sel).next();
    let headings: Vec<ElementRef<'_>> = root.select(&heading_sel).collect();
    if cast_table.is_none() && headings.is_empty() {
        return Err(ExtractError::MissingStructure("full credits"));
    }

    let mut crew = Crew::default();

    if let Some(table) = cast_table {
        let members = extract_cast_members(table)?;
        if !members.is_empty() {
            crew.departments.push(Department {
                department: CAST_DEPARTMENT.to_string(),
                members,
            });
        }
    }

    for heading in headings {
        let Some(department_id) = heading.value().attr("id") else {
            continue;
        };
        if department_id.is_empty() || department_id.eq_ignore_ascii_case("cast") {
            continue;
        }
        let Some(table) = heading.next_siblings().find_map(ElementRef::wrap) else {
            continue;
        };
        let is_credits_table = table.value().name() == "table"
            && !table.value().classes().any(|class| class == "cast_list");
        if !is_credits_table {
            continue;
        }

        let members = extract_department_members(table)?;
        if !members.is_empty() {
            crew.departments.push(Department {
                department: capitalize(department_id),
                members,
            });
        }
    }

    Ok(crew)
}

fn extract_cast_members(table: ElementRef<'_>) -> Result<Vec<CrewMember>, ExtractError> {
    let row_sel = selector("tr")?;
    let name_sel = selector("td:nth-child(2) a")?;
    let photo_sel = selector("td.primary_photo img")?;
    let character_sel = selector("td.character a")?;

    let mut members = Vec::new();
    for row in table.select(&row_sel) {
        let Some(name_link) = row.select(&name_sel).next() else {
            continue;
        };
        let Some(id) = name_link.value().attr("href").and_then(|href| capture(&NAME_ID, href)) else {
            continue;
        };
        let Some(name) = element_text(name_link) else {
            continue;
        };

        let characters: Vec<Character> = row
            .select(&character_sel)
            .filter_map(|link| {
                let name = element_text(link)?;
                let id = link
                    .value()
                    .attr("href")
                    .and_then(|href| CHARACTER_ID.find(href))
                    .map(|m| m.as_str().to_string());
                Some(Character { name, id })
            })
            .collect();
        if characters.is_empty() {
            continue;
        }

        let image_url = row
            .select(&photo_sel)
            .next()
            .and_then(|img| img.value().attr("src"))
            .and_then(|src| text_or_none(src.to_string()));

        members.push(CrewMember {
            name,
            id,
            role: "cast".to_string(),
            characters: Some(characters),
            image_url,
        });
    }
    Ok(members)
}

fn extract_department_members(table: ElementRef<'_>) -> Result<Vec<CrewMember>, ExtractError> {
    let row_sel = selector("tbody tr")?;
    let name_sel = selector("td.name a")?;
    let credit_sel = selector("td.credit")?;

    let mut members = Vec::new();
    for row in table.select(&row_sel) {
        let Some(name_link) = row.select(&name_sel).next() else {
            continue;
        };
        let Some(id) = name_link.value().attr("href").and_then(|href| capture(&NAME_ID, href)) else {
            continue;
        };
        let Some(name) = element_text(name_link) else {
            continue;
        };
        let role = row
            .select(&credit_sel)
            .next()
            .and_then(element_text)
            .unwrap_or_default();

        members.push(CrewMember {
            name,
            id,
            role,
            characters: None,
            image_url: None,
        });
    }
    Ok(members)
}

const PRODUCTION_SECTION: &str = "div[data-testid='sub-section-production']";
const DISTRIBUTION_SECTION: &str = "div[data-testid='sub-section-distribution']";
const EFFECTS_SECTION: &str = "div[data-testid='sub-section-specialEffects']";
const OTHER_SECTION: &str = "div[data-testid='sub-section-miscellaneous']";

/// Each category is queried on its own; categories with no valid entry are `None`.
pub fn extract_companies(html: &str) -> Result<Companies, ExtractError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut sections_found = 0usize;
    let mut category = |section: &str| -> Result<Option<Vec<Company>>, ExtractError> {
        let section_sel = selector(section)?;
        let Some(section_el) = root.select(&section_sel).next() else {
            return Ok(None);
        };
        sections_found += 1;
        let companies = extract_company_items(section_el)?;
        Ok(if companies.is_empty() {
            None
        } else {
            Some(companies)
        })
    };

    let companies = Companies {
        production: category(PRODUCTION_SECTION)?,
        distribution: category(DISTRIBUTION_SECTION)?,
        effects: category(EFFECTS_SECTION)?,
        other: category(OTHER_SECTION)?,
    };

    if sections_found == 0 {
        return Err(ExtractError::MissingStructure("company credits"));
    }
    Ok(companies)
}

fn extract_company_items(section: ElementRef<'_>) -> Result<Vec<Company>, ExtractError> {
    let item_sel = selector("ul.ipc-metadata-list li")?;
    let label_sel = selector(".ipc-metadata-list-item__label")?;

    Ok(section
        .select(&item_sel)
        .filter_map(|item| {
            let label = item.select(&label_sel).next()?;
            let name = element_text(label)?;
            let id = label
                .value()
                .attr("href")
                .and_then(|href| capture(&COMPANY_ID, href))?;
            Some(Company { name, id })
        })
        .collect())
}
