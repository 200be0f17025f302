//! Cleans model output down to renderable Mermaid source.
//!
//! Three passes run in order: fence extraction, line filtering, and
//! normalisation. Each pass is usable on its own.

use std::sync::LazyLock;

use regex::Regex;

const HEADER_KEYWORDS: &[&str] = &[
    "graph",
    "flowchart",
    "subgraph",
    "end",
    "sequenceDiagram",
    "gantt",
    "pie",
    "classDiagram",
    "stateDiagram",
    "gitGraph",
    "journey",
    "erDiagram",
    "requirementDiagram",
    "C4Context",
    "C4Container",
    "C4Component",
    "direction",
    "%%",
    "style",
    "click",
    "link",
    "linkStyle",
    "classDef",
    "class",
    "participant",
    "actor",
    "title",
    "section",
];

const EDGE_TOKENS: &[&str] = &[
    "-->", "->", "==>", "-.->", "---", "-.-", "--", "||", "}|", "|{", "o{", "}o",
];

static OPENING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)```\s*mermaid[^\n]*\n").expect("valid fence regex"));

static NODE_DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][\w-]*\s*[\[\(\{>]").expect("valid node regex")
});

static EDGE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\|[^|\n]*\|").expect("valid edge label regex"));

/// Full cascade. Returns `None` when nothing renderable is left.
pub fn sanitize(raw: &str) -> Option<String> {
    let code = normalize(&filter_lines(&extract_fenced(raw)));
    if code.is_empty() { None } else { Some(code) }
}

/// Content of the first ```` ```mermaid ```` fence, up to the last closing fence.
/// Input without a mermaid fence is returned trimmed.
pub fn extract_fenced(raw: &str) -> String {
    let Some(open) = OPENING_FENCE.find(raw) else {
        return raw.trim().to_string();
    };
    let rest = &raw[open.end()..];
    let body = match rest.rfind("```") {
        Some(close) => &rest[..close],
        None => rest,
    };
    body.trim().to_string()
}

/// Keeps the leading run of lines that look like Mermaid.
///
/// Lines before the first recognised line are skipped; the first unrecognised
/// line after it ends the diagram. Lines inside `subgraph`/`end` or `{`/`}`
/// blocks are always kept.
pub fn filter_lines(code: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut depth: usize = 0;

    for line in code.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("```") {
            continue;
        }

        let recognised = depth > 0 || is_mermaid_line(trimmed);
        if !recognised {
            if kept.is_empty() {
                continue;
            }
            break;
        }

        depth = next_depth(depth, trimmed);
        kept.push(line.trim_end());
    }

    kept.join("\n")
}

/// Drops quotes inside edge labels and trailing semicolons, normalises line endings.
pub fn normalize(code: &str) -> String {
    let unified = code.replace("\r\n", "\n").replace('\r', "\n");
    unified
        .lines()
        .map(|line| {
            let line = EDGE_LABEL.replace_all(line, |caps: &regex::Captures<'_>| {
                caps[0].replace('"', "")
            });
            line.trim_end().trim_end_matches(';').trim_end().to_string()
        })
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn is_mermaid_line(line: &str) -> bool {
    let starts_with_keyword = HEADER_KEYWORDS.iter().any(|keyword| {
        line.strip_prefix(keyword).is_some_and(|rest| {
            rest.is_empty()
                || rest.starts_with(|c: char| c.is_whitespace() || c == '-' || c == '{')
                || keyword.starts_with('%')
        })
    });
    starts_with_keyword
        || EDGE_TOKENS.iter().any(|token| line.contains(token))
        || NODE_DEFINITION.is_match(line)
        || line == "}"
}

fn next_depth(depth: usize, line: &str) -> usize {
    let opens_subgraph = line.starts_with("subgraph");
    let closes_subgraph = line == "end";
    let opens_brace = line.ends_with('{');
    let closes_brace = line.starts_with('}');

    let mut depth = depth;
    if opens_subgraph || opens_brace {
        depth += 1;
    }
    if closes_subgraph || closes_brace {
        depth = depth.saturating_sub(1);
    }
    depth
}
