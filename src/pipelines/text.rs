//! Text pipeline: extract text, split it into sections, summarize.
//!
//! Pure local processing, no external services:
//! - `extract_text`: document → text "text"
//! - `split_sections`: text "text" → many markdown "section"
//! - `summarize`: many markdown "section" → summary "summary"

use anyhow::{bail, Result};

use crate::core::{
    Arguments, Operation, OperationContext, OperationRegistry, OperationResult, Output,
    OutputSpec, ParamSpec, RegistryError,
};
use crate::domain::{Artifact, ArtifactKind};

pub const TEXT_LABEL: &str = "text";
pub const SECTION_LABEL: &str = "section";
pub const SUMMARY_LABEL: &str = "summary";

/// Longest summary line kept per section
const MAX_SENTENCE_CHARS: usize = 200;

/// Register the three text operations, in order
pub fn register(registry: &mut OperationRegistry) -> Result<(), RegistryError> {
    registry
        .register(
            Operation::builder("extract_text")
                .describe("Decode a text-like document into plain text")
                .input(ParamSpec::one("document", ArtifactKind::Document))
                .output(OutputSpec::one(ArtifactKind::Text, TEXT_LABEL))
                .handler(extract_text)
                .build()?,
        )?
        .register(
            Operation::builder("split_sections")
                .describe("Split text at markdown headings, or at blank lines when there are none")
                .input(ParamSpec::one("text", ArtifactKind::Text).with_label(TEXT_LABEL))
                .output(OutputSpec::many(ArtifactKind::Markdown, SECTION_LABEL))
                .handler(split_sections)
                .build()?,
        )?
        .register(
            Operation::builder("summarize")
                .describe("Extractive summary: the first sentence of each section")
                .input(ParamSpec::many("sections", ArtifactKind::Markdown).with_label(SECTION_LABEL))
                .output(OutputSpec::one(ArtifactKind::Summary, SUMMARY_LABEL))
                .handler(summarize)
                .build()?,
        )?;
    Ok(())
}

/// A registry holding only the text pipeline
pub fn registry() -> Result<OperationRegistry, RegistryError> {
    let mut registry = OperationRegistry::new();
    register(&mut registry)?;
    Ok(registry)
}

fn is_text_like(mime_type: &str) -> bool {
    mime_type.starts_with("text/")
        || matches!(
            mime_type,
            "application/json" | "application/xml" | "application/yaml"
        )
}

fn extract_text(_ctx: &OperationContext, args: Arguments) -> Result<OperationResult> {
    let document = args.one(0)?;
    if !is_text_like(document.mime_type()) {
        bail!("Cannot extract text from {}", document.mime_type());
    }

    let text = String::from_utf8(document.content().to_vec())?;
    let text = text.replace("\r\n", "\n");

    Ok(Output::new(ArtifactKind::Text)
        .with_text(text.trim_end())
        .with_metadata("source_mime_type", document.mime_type())
        .into())
}

fn split_sections(_ctx: &OperationContext, args: Arguments) -> Result<OperationResult> {
    let text = args.one(0)?.content_as_str().into_owned();

    let sections = if text.lines().any(is_heading) {
        split_at_headings(&text)
    } else {
        split_at_blank_lines(&text)
    };

    let outputs = sections
        .into_iter()
        .map(|section| {
            let title = section
                .lines()
                .next()
                .filter(|line| is_heading(line))
                .map(|line| line.trim_start_matches('#').trim().to_string());
            let mut output = Output::new(ArtifactKind::Markdown)
                .with_text(section)
                .with_mime_type("text/markdown");
            if let Some(title) = title {
                output = output.with_metadata("title", title);
            }
            output
        })
        .collect::<Vec<_>>();

    Ok(outputs.into())
}

fn summarize(_ctx: &OperationContext, args: Arguments) -> Result<OperationResult> {
    let sections = args.many(0)?;

    let lines: Vec<String> = sections
        .iter()
        .filter_map(section_summary)
        .map(|line| format!("- {}", line))
        .collect();

    Ok(Output::new(ArtifactKind::Summary)
        .with_text(lines.join("\n"))
        .with_mime_type("text/markdown")
        .with_metadata("sections", sections.len())
        .into())
}

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

fn split_at_headings(text: &str) -> Vec<String> {
    let mut sections: Vec<Vec<&str>> = Vec::new();
    for line in text.lines() {
        if is_heading(line) || sections.is_empty() {
            sections.push(Vec::new());
        }
        if let Some(current) = sections.last_mut() {
            current.push(line);
        }
    }

    sections
        .into_iter()
        .map(|lines| lines.join("\n").trim().to_string())
        .filter(|section| !section.is_empty())
        .collect()
}

fn split_at_blank_lines(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(str::to_string)
        .collect()
}

/// First sentence of a section body, headings excluded
fn section_summary(section: &Artifact) -> Option<String> {
    let content = section.content_as_str();
    let title = content
        .lines()
        .find(|line| is_heading(line))
        .map(|line| line.trim_start_matches('#').trim().to_string());

    let body: String = content
        .lines()
        .filter(|line| !is_heading(line))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let sentence = body
        .find(|c| matches!(c, '.' | '!' | '?'))
        .map(|end| &body[..=end])
        .unwrap_or(&body);
    let sentence: String = sentence.chars().take(MAX_SENTENCE_CHARS).collect();

    match (title, sentence.is_empty()) {
        (Some(title), true) => Some(title),
        (Some(title), false) => Some(format!("{}: {}", title, sentence)),
        (None, false) => Some(sentence),
        (None, true) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_heading() {
        assert!(is_heading("# Title"));
        assert!(is_heading("### Deep"));
        assert!(!is_heading("#hashtag"));
        assert!(!is_heading("plain"));
        assert!(!is_heading("####### too deep"));
    }

    #[test]
    fn test_split_at_headings_keeps_preamble() {
        let text = "Intro line.\n\n# One\nFirst body.\n\n## Two\nSecond body.";
        let sections = split_at_headings(text);

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0], "Intro line.");
        assert_eq!(sections[1], "# One\nFirst body.");
        assert_eq!(sections[2], "## Two\nSecond body.");
    }

    #[test]
    fn test_split_at_blank_lines() {
        let sections = split_at_blank_lines("one\n\n\n two \n\nthree");
        assert_eq!(sections, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_registry_order() {
        let registry = registry().unwrap();
        let names: Vec<_> = registry.operations().iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, vec!["extract_text", "split_sections", "summarize"]);
    }
}
