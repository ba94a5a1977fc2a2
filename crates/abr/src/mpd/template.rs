// References:
// 1. ISO/IEC 23009-1:2022, 5.3.9.4.4 Template-based Segment URL construction
// 2. https://dashif.org/docs/DASH-IF-IOP-v4.3.pdf

use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;

// Only %0[width]d is permitted as format tag, so the padding is done by hand instead of going
// through a printf implementation.
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(RepresentationID|Number|Time|Bandwidth|SubNumber)(?:%0(\d+)d)?$").unwrap()
});

/// Values for the `$Identifier$` substitution of a `SegmentTemplate`.
#[derive(Debug, Default)]
pub struct Template {
    args: HashMap<&'static str, String>,
}

impl Template {
    pub const REPRESENTATION_ID: &'static str = "RepresentationID";
    pub const NUMBER: &'static str = "Number";
    pub const TIME: &'static str = "Time";
    pub const BANDWIDTH: &'static str = "Bandwidth";
    pub const SUB_NUMBER: &'static str = "SubNumber";

    pub fn new() -> Self {
        Self {
            args: HashMap::with_capacity(5),
        }
    }

    pub fn insert(&mut self, key: &'static str, value: impl ToString) {
        self.args.insert(key, value.to_string());
    }

    /// Substitutes all identifiers. `$$` is an escaped `$`.
    ///
    /// Returns `None` for unknown identifiers, identifiers without a value, and unterminated
    /// `$` signs. `RepresentationID` does not accept a format tag.
    pub fn resolve(&self, template: &str) -> Option<String> {
        let mut output = String::with_capacity(template.len() + 16);
        let mut rest = template;
        while let Some(start) = rest.find('$') {
            output.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after.find('$')?;
            let identifier = &after[..end];
            rest = &after[end + 1..];

            if identifier.is_empty() {
                output.push('$');
                continue;
            }
            let caps = IDENTIFIER_REGEX.captures(identifier)?;
            let key = caps.get(1)?.as_str();
            let value = self.args.get(key)?;
            match caps.get(2) {
                Some(_) if key == Self::REPRESENTATION_ID => return None,
                Some(width) => {
                    let width: usize = width.as_str().parse().ok()?;
                    output.push_str(&format!("{value:0>width$}"));
                }
                None => output.push_str(value),
            }
        }
        output.push_str(rest);
        Some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        let mut template = Template::new();
        template.insert(Template::REPRESENTATION_ID, "v1");
        template.insert(Template::NUMBER, 2);
        template.insert(Template::TIME, 3);
        template.insert(Template::BANDWIDTH, 4);
        template.insert(Template::SUB_NUMBER, 5);
        template
    }

    #[test]
    fn test_template_replace() {
        let template = template();
        assert_eq!(
            template.resolve("$RepresentationID$/$Number%05d$.m4s").as_deref(),
            Some("v1/00002.m4s")
        );
        assert_eq!(
            template.resolve("$Time$-$Bandwidth%02d$-$SubNumber$").as_deref(),
            Some("3-04-5")
        );
        assert_eq!(template.resolve("init.mp4").as_deref(), Some("init.mp4"));
        // Wider values are not truncated
        assert_eq!(template.resolve("$Number%01d$").as_deref(), Some("2"));
    }

    #[test]
    fn test_escaped_dollar() {
        assert_eq!(
            template().resolve("price$$/$Number$$$").as_deref(),
            Some("price$/2$")
        );
    }

    #[test]
    fn test_invalid_identifiers() {
        let template = template();
        assert_eq!(template.resolve("$Foo$.m4s"), None);
        assert_eq!(template.resolve("$Number"), None);
        assert_eq!(template.resolve("$RepresentationID%02d$"), None);
        assert_eq!(Template::new().resolve("$Number$"), None);
    }
}
