use std::collections::HashSet;
use std::sync::LazyLock;

use ammonia::Builder;

// Implementations must be total and idempotent.
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, html: &str) -> String;
}

static ANSWER_POLICY: LazyLock<Builder<'static>> = LazyLock::new(|| {
    let mut builder = Builder::default();
    builder
        .add_generic_attributes(["class"])
        .add_tag_attributes("div", ["style"]);
    builder
});

static NO_TAGS_POLICY: LazyLock<Builder<'static>> = LazyLock::new(|| {
    let mut builder = Builder::default();
    builder.tags(HashSet::new());
    builder
});

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlSanitizer;

impl Sanitizer for HtmlSanitizer {
    fn sanitize(&self, html: &str) -> String {
        ANSWER_POLICY.clean(html).to_string()
    }
}

pub fn strip_tags(html: &str) -> String {
    NO_TAGS_POLICY.clean(html).to_string()
}
