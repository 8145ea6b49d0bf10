use std::sync::LazyLock;

use pulldown_cmark::{html, CodeBlockKind, CowStr, Event, Options, Parser, Tag, TagEnd};
use syntect::html::{ClassStyle, ClassedHTMLGenerator};
use syntect::parsing::SyntaxSet;
use syntect::util::LinesWithEndings;

static SYNTAX_SET: LazyLock<SyntaxSet> = LazyLock::new(SyntaxSet::load_defaults_newlines);

pub const LIST_ITEM_GLYPH: &str = "➤ ";

const CODE_BLOCK_OPEN: &str = r#"<div class="highlighted-code" style="background: #d2d6d6; padding: 8px; border-radius: 5px; overflow-x: auto; font-family: monospace;">"#;

fn options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options
}

// Leading spaces are kept so text after a citation does not run into it.
pub fn render_fragment(text: &str) -> String {
    let body = text.trim_start_matches([' ', '\t']);
    let leading = &text[..text.len() - body.len()];
    let rendered = render_markdown(body);
    format!("{leading}{}", rendered.trim_end())
}

pub fn render_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 2);
    let mut pending: Vec<Event<'_>> = Vec::new();
    let mut item_depth = 0usize;
    let mut code: Option<(Option<String>, String)> = None;

    for event in Parser::new_ext(text, options()) {
        if code.is_some() {
            match event {
                Event::Text(chunk) => {
                    if let Some((_, body)) = code.as_mut() {
                        body.push_str(&chunk);
                    }
                }
                Event::End(TagEnd::CodeBlock) => {
                    if let Some((lang, body)) = code.take() {
                        out.push_str(&render_code_block(&body, lang.as_deref()));
                    }
                }
                _ => {}
            }
            continue;
        }

        match event {
            Event::Start(Tag::Paragraph) => flush(&mut out, &mut pending),
            Event::End(TagEnd::Paragraph) => {
                flush(&mut out, &mut pending);
                if item_depth == 0 {
                    out.push('\n');
                }
            }
            Event::Start(Tag::List(_)) | Event::End(TagEnd::List(_)) => {
                flush(&mut out, &mut pending);
            }
            Event::Start(Tag::Item) => {
                flush(&mut out, &mut pending);
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&"  ".repeat(item_depth));
                out.push_str(LIST_ITEM_GLYPH);
                item_depth += 1;
            }
            Event::End(TagEnd::Item) => {
                flush(&mut out, &mut pending);
                item_depth = item_depth.saturating_sub(1);
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::Start(Tag::CodeBlock(kind)) => {
                flush(&mut out, &mut pending);
                let lang = match kind {
                    CodeBlockKind::Fenced(info) => info.split_whitespace().next().map(str::to_string),
                    CodeBlockKind::Indented => None,
                };
                code = Some((lang, String::new()));
            }
            other => pending.push(other),
        }
    }

    flush(&mut out, &mut pending);
    out
}

fn flush<'a>(out: &mut String, pending: &mut Vec<Event<'a>>) {
    if !pending.is_empty() {
        html::push_html(out, pending.drain(..));
    }
}

fn render_code_block(code: &str, lang: Option<&str>) -> String {
    let code = format!("{}\n", code.strip_suffix('\n').unwrap_or(code));

    let body = match highlight_code(&code, lang) {
        Some(highlighted) => highlighted,
        None => escape_text(&code),
    };

    format!("{CODE_BLOCK_OPEN}{body}</div>\n")
}

fn highlight_code(code: &str, lang: Option<&str>) -> Option<String> {
    let syntax = match lang {
        Some(lang) => match SYNTAX_SET.find_syntax_by_token(lang) {
            Some(syntax) => syntax,
            None => {
                tracing::debug!("no syntax for code block language `{lang}`, rendering plain");
                return None;
            }
        },
        None => SYNTAX_SET.find_syntax_plain_text(),
    };

    let mut generator =
        ClassedHTMLGenerator::new_with_class_style(syntax, &SYNTAX_SET, ClassStyle::Spaced);
    for line in LinesWithEndings::from(code) {
        if let Err(err) = generator.parse_html_for_line_which_includes_newline(line) {
            tracing::warn!("code highlighting failed, rendering plain: {err}");
            return None;
        }
    }
    Some(generator.finalize())
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    html::push_html(&mut out, std::iter::once(Event::Text(CowStr::Borrowed(text))));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_are_inlined() {
        assert_eq!(render_fragment("Answer one"), "Answer one");
        assert_eq!(
            render_fragment("**bold** and `code`"),
            "<strong>bold</strong> and <code>code</code>"
        );
    }

    #[test]
    fn leading_space_after_a_citation_is_kept() {
        assert_eq!(render_fragment(" and more"), " and more");
        assert_eq!(render_fragment(". More"), ". More");
    }

    #[test]
    fn list_items_get_the_glyph() {
        assert_eq!(render_fragment("- first\n- second"), "➤ first\n➤ second");
    }

    #[test]
    fn nested_items_are_indented() {
        assert_eq!(
            render_fragment("- outer\n  - inner"),
            "➤ outer\n  ➤ inner"
        );
    }

    #[test]
    fn fenced_code_is_highlighted_inside_scrollable_block() {
        let html = render_fragment("```rust\nfn main() {}\n```");
        assert!(html.starts_with(CODE_BLOCK_OPEN));
        assert!(html.ends_with("</div>"));
        assert!(html.contains("<span class="));
        assert!(html.contains("main"));
    }

    #[test]
    fn unknown_language_degrades_to_plain_text() {
        let html = render_fragment("```no-such-language\n<b>x</b>\n```");
        assert!(html.contains("&lt;b&gt;x&lt;/b&gt;"));
        assert!(!html.contains("<span"));
    }

    #[test]
    fn footnote_syntax_stays_literal() {
        assert_eq!(render_fragment("see [^7]"), "see [^7]");
    }

    #[test]
    fn empty_fragment_renders_empty() {
        assert_eq!(render_fragment(""), "");
        assert_eq!(render_fragment(" "), " ");
    }
}
