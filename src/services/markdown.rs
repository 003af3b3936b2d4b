use std::sync::LazyLock;

use pulldown_cmark::{html, CodeBlockKind, CowStr, Event, Options, Parser, Tag, TagEnd};
use syntect::html::{ClassStyle, ClassedHTMLGenerator};
use syntect::parsing::{SyntaxReference, SyntaxSet};
use syntect::util::LinesWithEndings;

static SYNTAX_SET: LazyLock<SyntaxSet> = LazyLock::new(SyntaxSet::load_defaults_newlines);

const UNSAFE_SCHEMES: &[&str] = &["javascript:", "vbscript:", "data:"];

/// Render chat text as display-safe HTML.
///
/// Pure: re-rendering a growing prefix of the same reply never depends on
/// earlier calls, which is what streaming relies on.
pub fn render_markdown(input: &str) -> String {
    let options =
        Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TABLES | Options::ENABLE_TASKLISTS;
    let parser = Parser::new_ext(input, options);

    let mut ctx = RenderContext::default();
    for event in parser {
        ctx.handle_event(event);
    }

    let mut output = String::new();
    html::push_html(&mut output, ctx.finish().into_iter());
    output
}

struct CodeBuffer<'a> {
    kind: CodeBlockKind<'a>,
    code: String,
}

#[derive(Default)]
struct RenderContext<'a> {
    events: Vec<Event<'a>>,
    code_block: Option<CodeBuffer<'a>>,
}

impl<'a> RenderContext<'a> {
    fn handle_event(&mut self, event: Event<'a>) {
        if let Some(block) = self.code_block.as_mut() {
            match event {
                Event::Text(text) => block.code.push_str(&text),
                Event::End(TagEnd::CodeBlock) => self.flush_code_block(),
                _ => {}
            }
            return;
        }

        match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                self.code_block = Some(CodeBuffer {
                    kind,
                    code: String::new(),
                });
            }
            // Chat text treats single newlines as line breaks.
            Event::SoftBreak => self.events.push(Event::HardBreak),
            // Raw HTML from the model is shown, never interpreted.
            Event::Html(raw) | Event::InlineHtml(raw) => self.events.push(Event::Text(raw)),
            Event::Start(Tag::Link {
                link_type,
                dest_url,
                title,
                id,
            }) => self.events.push(Event::Start(Tag::Link {
                link_type,
                dest_url: safe_url(dest_url),
                title,
                id,
            })),
            Event::Start(Tag::Image {
                link_type,
                dest_url,
                title,
                id,
            }) => self.events.push(Event::Start(Tag::Image {
                link_type,
                dest_url: safe_url(dest_url),
                title,
                id,
            })),
            other => self.events.push(other),
        }
    }

    fn flush_code_block(&mut self) {
        let Some(CodeBuffer { kind, code }) = self.code_block.take() else {
            return;
        };

        let language = match &kind {
            CodeBlockKind::Fenced(info) => fence_language(info),
            CodeBlockKind::Indented => None,
        };

        match highlight_code(language.as_deref(), &code) {
            Some(highlighted) => {
                let class = language
                    .map(|lang| format!(" class=\"language-{}\"", lang))
                    .unwrap_or_default();
                self.events.push(Event::Html(CowStr::from(format!(
                    "<pre><code{}>{}</code></pre>\n",
                    class, highlighted
                ))));
            }
            None => {
                self.events.push(Event::Start(Tag::CodeBlock(kind)));
                self.events.push(Event::Text(CowStr::from(code)));
                self.events.push(Event::End(TagEnd::CodeBlock));
            }
        }
    }

    fn finish(mut self) -> Vec<Event<'a>> {
        self.flush_code_block();
        self.events
    }
}

/// First word of the fence info string, restricted to characters that are
/// safe inside a class attribute.
fn fence_language(info: &str) -> Option<String> {
    let lang: String = info
        .split_whitespace()
        .next()?
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '#' | '.'))
        .collect();
    if lang.is_empty() {
        None
    } else {
        Some(lang)
    }
}

fn find_syntax(language: Option<&str>, code: &str) -> Option<&'static SyntaxReference> {
    let syntax_set = &*SYNTAX_SET;
    language
        .and_then(|lang| syntax_set.find_syntax_by_token(lang))
        .or_else(|| syntax_set.find_syntax_by_first_line(code))
}

fn highlight_code(language: Option<&str>, code: &str) -> Option<String> {
    let syntax = find_syntax(language, code)?;
    let mut generator =
        ClassedHTMLGenerator::new_with_class_style(syntax, &SYNTAX_SET, ClassStyle::Spaced);
    for line in LinesWithEndings::from(code) {
        if let Err(e) = generator.parse_html_for_line_which_includes_newline(line) {
            tracing::warn!("Syntax highlighting failed: {}", e);
            return None;
        }
    }
    Some(generator.finalize())
}

fn safe_url(url: CowStr<'_>) -> CowStr<'_> {
    let normalized = url.trim().to_ascii_lowercase();
    if UNSAFE_SCHEMES.iter().any(|scheme| normalized.starts_with(scheme)) {
        CowStr::Borrowed("#")
    } else {
        url
    }
}
