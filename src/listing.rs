//! Search-results listing: query construction, link extraction, pagination.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::fetcher::HttpFetcher;
use crate::models::is_all_departments;

/// Path fragment shared by every section detail page.
pub const SECTION_MARKER: &str = "/turmas/";

/// Upper bound on listing pages per walk, in case the site keeps echoing a page.
pub const MAX_PAGES: u32 = 200;

static RESULTS_TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table.table").unwrap());
static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static PAGINATION: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".pagination").unwrap());
static NEXT_CANDIDATE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[rel=next], .next, li, a, span").unwrap());

/// What the pagination control says about the page after this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageControl {
    Absent,
    NoNext,
    NextDisabled,
    NextAvailable,
}

/// Builds the search URL for one (period, program, department) combination.
///
/// A discipline code, when given, replaces the department filter. A department
/// filter is sent as `<DEPT>00`, which the site matches as a substring of the
/// discipline code.
pub fn build_search_url(
    base_url: &str,
    program_id: &str,
    department: Option<&str>,
    period: &str,
    discipline_code: Option<&str>,
) -> String {
    let filter = match (discipline_code, department) {
        (Some(code), _) if !code.trim().is_empty() => code.trim().to_uppercase(),
        (_, Some(dept)) if !is_all_departments(dept) => format!("{}00", dept.trim().to_uppercase()),
        _ => String::new(),
    };

    let params = [
        ("utf8", "✓"),
        ("q[anosemestre_eq]", period),
        ("q[disciplina_cod_departamento_eq]", ""),
        ("button", ""),
        ("q[idturno_eq]", ""),
        ("q[idlocalidade_eq]", ""),
        ("q[vagas_turma_curso_idcurso_eq]", program_id),
        ("q[disciplina_disciplinas_curriculos_idcurriculo_eq]", ""),
        ("q[curso_ferias_eq]", ""),
        ("q[idturmamodalidade_eq]", ""),
        ("q[disciplina_nome_or_disciplina_codigo_cont]", filter.as_str()),
    ];

    let query = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}?{}", base_url, query)
}

/// Collects absolute section detail links from a listing page, in page order.
///
/// Only the results table is scanned when the page has one.
pub fn extract_detail_links(document: &Html, origin: &Url) -> Vec<String> {
    let anchors: Vec<ElementRef> = match document.select(&RESULTS_TABLE).next() {
        Some(table) => table.select(&LINK).collect(),
        None => {
            debug!("no results table found, scanning whole document");
            document.select(&LINK).collect()
        }
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in anchors {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(absolute) = origin.join(href.trim()) else {
            continue;
        };
        if !absolute.path().contains(SECTION_MARKER) {
            continue;
        }
        let absolute = absolute.to_string();
        if seen.insert(absolute.clone()) {
            links.push(absolute);
        }
    }
    links
}

pub fn page_control(document: &Html) -> PageControl {
    let Some(control) = document.select(&PAGINATION).next() else {
        return PageControl::Absent;
    };

    match control.select(&NEXT_CANDIDATE).find(is_next_affordance) {
        None => PageControl::NoNext,
        Some(next) if is_disabled(next) => PageControl::NextDisabled,
        Some(_) => PageControl::NextAvailable,
    }
}

fn is_next_affordance(element: &ElementRef) -> bool {
    let value = element.value();
    if value.attr("rel") == Some("next") || value.classes().any(|c| c == "next") {
        return true;
    }
    let text = element.text().collect::<String>();
    let text = text.trim();
    matches!(text, "»" | "›" | ">")
        || text.starts_with("Próx")
        || text.starts_with("Next")
        || text.starts_with("Seguinte")
}

fn is_disabled(element: ElementRef) -> bool {
    let marks_disabled = |el: &ElementRef| {
        el.value().classes().any(|c| c == "disabled")
            || el.value().attr("aria-disabled") == Some("true")
    };

    if marks_disabled(&element) {
        return true;
    }
    if element
        .parent()
        .and_then(ElementRef::wrap)
        .is_some_and(|parent| marks_disabled(&parent))
    {
        return true;
    }

    let has_target = |el: &ElementRef| {
        el.value()
            .attr("href")
            .map(|href| !href.trim().is_empty() && href.trim() != "#")
            .unwrap_or(false)
    };
    if element.value().name() == "a" {
        !has_target(&element)
    } else {
        !element.select(&LINK).any(|a| has_target(&a))
    }
}

/// Walks `initial_url&page=N` from page 1 and returns every distinct detail link.
///
/// Stops on a failed fetch, a page with no new links, a missing pagination
/// control, a missing or disabled "next" entry, or after `max_pages` pages.
pub async fn walk_pages(
    fetcher: &mut HttpFetcher,
    initial_url: &str,
    origin: &Url,
    page_delay: Duration,
    max_pages: u32,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    let mut page = 1;

    loop {
        let url = format!("{}&page={}", initial_url, page);
        let Some(html) = fetcher.fetch(&url).await else {
            debug!(page, "listing page unavailable, stopping");
            break;
        };

        let (page_links, control) = {
            let document = Html::parse_document(&html);
            (extract_detail_links(&document, origin), page_control(&document))
        };
        let mut new_links = 0;
        for link in page_links {
            if seen.insert(link.clone()) {
                links.push(link);
                new_links += 1;
            }
        }
        debug!(page, new_links, control = ?control, "listing page parsed");

        if new_links == 0 || control != PageControl::NextAvailable {
            break;
        }
        if page >= max_pages {
            warn!(url = %initial_url, "page cap reached, stopping pagination");
            break;
        }

        page += 1;
        tokio::time::sleep(page_delay).await;
    }

    info!(pages = page, links = links.len(), "listing walk finished");
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn origin() -> Url {
        Url::parse("https://app.uff.br").unwrap()
    }

    fn listing(ids: &[u32], pagination: &str) -> String {
        let rows: String = ids
            .iter()
            .map(|id| {
                format!(
                    r#"<tr><td><a href="/graduacao/quadrodehorarios/turmas/{id}">GQI0000{id}</a></td></tr>"#
                )
            })
            .collect();
        format!(
            r#"<html><body><table class="table"><tr><th>Código</th></tr>{rows}</table>{pagination}</body></html>"#
        )
    }

    const NEXT_ENABLED: &str = r#"<ul class="pagination"><li><a href="?page=1">1</a></li><li class="next"><a rel="next" href="?page=2">Próximo ›</a></li></ul>"#;
    const NEXT_DISABLED: &str = r#"<ul class="pagination"><li><a href="?page=1">1</a></li><li class="next disabled"><span>Próximo ›</span></li></ul>"#;

    #[test]
    fn search_url_uses_department_prefix() {
        let url = build_search_url("https://x/q/", "28", Some("gqi"), "20252", None);
        assert!(url.starts_with("https://x/q/?utf8=✓&q[anosemestre_eq]=20252&"));
        assert!(url.contains("q[vagas_turma_curso_idcurso_eq]=28&"));
        assert!(url.ends_with("q[disciplina_nome_or_disciplina_codigo_cont]=GQI00"));
    }

    #[test]
    fn search_url_prefers_discipline_code() {
        let url = build_search_url("https://x/q/", "29", Some("GQI"), "20251", Some("maf00052"));
        assert!(url.ends_with("q[disciplina_nome_or_disciplina_codigo_cont]=MAF00052"));
    }

    #[test]
    fn search_url_without_filter() {
        for department in [None, Some("ALL"), Some("TODOS")] {
            let url = build_search_url("https://x/q/", "28", department, "20252", None);
            assert!(url.ends_with("q[disciplina_nome_or_disciplina_codigo_cont]="));
        }
    }

    #[test]
    fn links_are_absolute_and_deduplicated() {
        let html = r#"<table class="table">
            <tr><td><a href="/graduacao/quadrodehorarios/turmas/1">A</a></td></tr>
            <tr><td><a href="/graduacao/quadrodehorarios/turmas/1">A again</a></td></tr>
            <tr><td><a href="https://app.uff.br/graduacao/quadrodehorarios/turmas/2">B</a></td></tr>
            <tr><td><a href="/graduacao/quadrodehorarios/disciplinas/9">not a section</a></td></tr>
        </table>"#;
        let links = extract_detail_links(&Html::parse_document(html), &origin());
        assert_eq!(
            links,
            vec![
                "https://app.uff.br/graduacao/quadrodehorarios/turmas/1".to_string(),
                "https://app.uff.br/graduacao/quadrodehorarios/turmas/2".to_string(),
            ]
        );
    }

    #[test]
    fn links_fall_back_to_whole_document() {
        let html = r#"<div><a href="/graduacao/quadrodehorarios/turmas/7">X</a></div>"#;
        assert_eq!(extract_detail_links(&Html::parse_document(html), &origin()).len(), 1);
    }

    #[test]
    fn results_table_limits_the_scan() {
        let html = r#"<a href="/graduacao/quadrodehorarios/turmas/99">outside</a>
            <table class="table"><tr><td><a href="/graduacao/quadrodehorarios/turmas/1">in</a></td></tr></table>"#;
        let links = extract_detail_links(&Html::parse_document(html), &origin());
        assert_eq!(links.len(), 1);
        assert!(links[0].ends_with("/turmas/1"));
    }

    #[test]
    fn pagination_control_states() {
        let parse = |html: &str| page_control(&Html::parse_document(html));
        assert_eq!(parse("<p>no control</p>"), PageControl::Absent);
        assert_eq!(parse(NEXT_ENABLED), PageControl::NextAvailable);
        assert_eq!(parse(NEXT_DISABLED), PageControl::NextDisabled);
        assert_eq!(
            parse(r#"<nav class="pagination"><span class="page current">3</span></nav>"#),
            PageControl::NoNext
        );
        assert_eq!(
            parse(r#"<nav class="pagination"><span class="next"><a rel="next" href="?page=4">Próx</a></span></nav>"#),
            PageControl::NextAvailable
        );
    }

    async fn mount_page(server: &MockServer, page: &str, body: String) {
        Mock::given(method("GET"))
            .and(path("/busca/"))
            .and(query_param("page", page))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn walk_stops_at_disabled_next() {
        let server = MockServer::start().await;
        mount_page(&server, "1", listing(&[1, 2], NEXT_ENABLED)).await;
        mount_page(&server, "2", listing(&[2, 3], NEXT_DISABLED)).await;
        mount_page(&server, "3", listing(&[4], NEXT_ENABLED)).await;

        let mut fetcher = HttpFetcher::new().unwrap();
        let start = format!("{}/busca/?q=1", server.uri());
        let links = walk_pages(&mut fetcher, &start, &origin(), Duration::ZERO, MAX_PAGES).await;

        assert_eq!(links.len(), 3);
        let unique: HashSet<_> = links.iter().collect();
        assert_eq!(unique.len(), links.len());
    }

    #[tokio::test]
    async fn walk_stops_when_page_adds_nothing() {
        let server = MockServer::start().await;
        mount_page(&server, "1", listing(&[1, 2], NEXT_ENABLED)).await;
        mount_page(&server, "2", listing(&[1, 2], NEXT_ENABLED)).await;
        mount_page(&server, "3", listing(&[5], NEXT_ENABLED)).await;

        let mut fetcher = HttpFetcher::new().unwrap();
        let start = format!("{}/busca/?q=1", server.uri());
        let links = walk_pages(&mut fetcher, &start, &origin(), Duration::ZERO, MAX_PAGES).await;
        assert_eq!(links.len(), 2);
    }

    #[tokio::test]
    async fn walk_stops_on_fetch_failure() {
        let server = MockServer::start().await;
        mount_page(&server, "1", listing(&[1], NEXT_ENABLED)).await;
        Mock::given(method("GET"))
            .and(path("/busca/"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut fetcher = HttpFetcher::new().unwrap();
        let start = format!("{}/busca/?q=1", server.uri());
        let links = walk_pages(&mut fetcher, &start, &origin(), Duration::ZERO, MAX_PAGES).await;
        assert_eq!(links.len(), 1);
    }

    #[tokio::test]
    async fn walk_single_page_without_control() {
        let server = MockServer::start().await;
        mount_page(&server, "1", listing(&[1, 2, 3], "")).await;

        let mut fetcher = HttpFetcher::new().unwrap();
        let start = format!("{}/busca/?q=1", server.uri());
        let links = walk_pages(&mut fetcher, &start, &origin(), Duration::ZERO, MAX_PAGES).await;
        assert_eq!(links.len(), 3);
    }

    /// Serves a fresh link and an enabled "next" entry on every page.
    struct EndlessListing;

    impl Respond for EndlessListing {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let page = request
                .url
                .query_pairs()
                .find(|(key, _)| key == "page")
                .and_then(|(_, value)| value.parse().ok())
                .unwrap_or(1);
            ResponseTemplate::new(200).set_body_string(listing(&[page], NEXT_ENABLED))
        }
    }

    #[tokio::test]
    async fn walk_stops_at_page_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busca/"))
            .respond_with(EndlessListing)
            .expect(3)
            .mount(&server)
            .await;

        let mut fetcher = HttpFetcher::new().unwrap();
        let start = format!("{}/busca/?q=1", server.uri());
        let links = walk_pages(&mut fetcher, &start, &origin(), Duration::ZERO, 3).await;
        assert_eq!(links.len(), 3);
    }
}
