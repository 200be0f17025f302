use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::agent::Stage;

pub const DOCUMENT_TITLE: &str = "Technical specification";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub agent_id: u8,
    pub title: String,
    pub text: String,
}

impl Section {
    pub fn new(stage: Stage, text: impl Into<String>) -> Self {
        Self {
            agent_id: stage.id(),
            title: stage.title().to_string(),
            text: text.into(),
        }
    }
}

/// The assembled technical specification: latest section per stage, in stage order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub token: Uuid,
    pub sections: Vec<Section>,
}

impl Document {
    pub fn new(token: Uuid, sections: Vec<Section>) -> Self {
        Self { token, sections }
    }

    pub fn page_title(&self) -> String {
        format!("{DOCUMENT_TITLE} [token: {}]", self.token)
    }

    pub fn markdown(&self) -> String {
        let mut output = format!("# {DOCUMENT_TITLE}\n");
        for section in &self.sections {
            output.push_str(&format!("\n## {}\n\n{}\n", section.title, section.text.trim()));
        }
        output
    }

    pub fn full_text(&self) -> String {
        self.sections
            .iter()
            .map(|section| section.text.trim())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Confluence storage-format body. `diagrams` maps titles to base64 PNGs.
    pub fn confluence_html(&self, diagrams: &BTreeMap<String, String>) -> String {
        let mut html = format!(
            "<h1>{DOCUMENT_TITLE}</h1>\n<p><em>Generated automatically for token {}.</em></p>\n",
            self.token
        );
        // Sections keep their stage number even when earlier stages are missing.
        for section in &self.sections {
            html.push_str(&format!(
                "<h2>{}. {}</h2>\n{}",
                section.agent_id,
                escape_html(&section.title),
                render_markdown(section.text.trim())
            ));
        }
        if !diagrams.is_empty() {
            html.push_str("<h2>Diagrams</h2>\n");
            for (title, image) in diagrams {
                html.push_str(&format!(
                    "<h3>{}</h3>\n<p><img src=\"data:image/png;base64,{}\" alt=\"{}\"/></p>\n",
                    escape_html(title),
                    image,
                    escape_html(title)
                ));
            }
        }
        html
    }
}

fn render_markdown(markdown: &str) -> String {
    use pulldown_cmark::{Options, Parser, html};

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(markdown, options);
    let mut output = String::new();
    html::push_html(&mut output, parser);
    output
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        Document::new(
            Uuid::nil(),
            vec![
                Section::new(Stage::Description, "Online **bookshop**\n"),
                Section::new(Stage::Goals, "- sell books\n- ship fast"),
            ],
        )
    }

    #[test]
    fn markdown_has_title_and_section_headers() {
        let markdown = sample().markdown();
        assert!(markdown.starts_with("# Technical specification\n"));
        assert!(markdown.contains("\n## Project description\n\nOnline **bookshop**\n"));
        assert!(markdown.contains("\n## Goals and objectives\n\n- sell books\n- ship fast\n"));
    }

    #[test]
    fn full_text_joins_sections_with_blank_line() {
        assert_eq!(
            sample().full_text(),
            "Online **bookshop**\n\n- sell books\n- ship fast"
        );
    }

    #[test]
    fn confluence_html_numbers_sections_and_embeds_diagrams() {
        let mut diagrams = BTreeMap::new();
        diagrams.insert("DFD".to_string(), "iVBORw0KGgo=".to_string());
        let html = sample().confluence_html(&diagrams);

        assert!(html.starts_with("<h1>Technical specification</h1>"));
        assert!(html.contains("<h2>1. Project description</h2>\n<p>Online <strong>bookshop</strong></p>"));
        assert!(html.contains("<h2>2. Goals and objectives</h2>\n<ul>"));
        assert!(html.contains("<h2>Diagrams</h2>\n<h3>DFD</h3>"));
        assert!(html.contains("src=\"data:image/png;base64,iVBORw0KGgo=\""));
    }

    #[test]
    fn confluence_html_keeps_stage_numbers_across_gaps() {
        let document = Document::new(
            Uuid::nil(),
            vec![
                Section::new(Stage::Description, "Bookshop"),
                Section::new(Stage::Users, "Students"),
            ],
        );
        let html = document.confluence_html(&BTreeMap::new());
        assert!(html.contains("<h2>1. Project description</h2>"));
        assert!(html.contains("<h2>3. User groups and roles</h2>"));
        assert!(!html.contains("<h2>2."));
    }

    #[test]
    fn confluence_html_skips_empty_diagram_block() {
        let html = sample().confluence_html(&BTreeMap::new());
        assert!(!html.contains("Diagrams"));
    }

    #[test]
    fn titles_are_escaped() {
        assert_eq!(escape_html("A & <B>"), "A &amp; &lt;B&gt;");
        let page = sample().page_title();
        assert_eq!(
            page,
            "Technical specification [token: 00000000-0000-0000-0000-000000000000]"
        );
    }
}
