//! Org note parsing for the note viewer.
//! The core turns outline-style marked-up text into a renderable document and pulls clock and
//! state-change history out of `:LOGBOOK:` drawers. Everything here is a pure function of its
//! input; callers supply the raw text and decide how to present the result.

pub mod core {
    use chrono::NaiveDateTime;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    /* ------------------------------ Document ------------------------------ */

    /// A parsed note: document-level metadata plus body blocks in source order.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Document {
        pub metadata: DocumentMetadata,
        #[serde(default)]
        pub blocks: Vec<BlockNode>,
    }

    /// Metadata collected from `#+KEY:` directives and the first property drawer.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DocumentMetadata {
        /// From the first `#+title:`; later ones are ignored.
        pub title: Option<String>,
        pub category: Option<String>,
        pub author: Option<String>,
        /// Free text from `#+date:`, not interpreted.
        pub date: Option<String>,
        /// `:ID:` from the first `:PROPERTIES:` drawer.
        pub id: Option<String>,
        #[serde(default)]
        pub tags: Vec<String>,
        /// Every other `#+KEY: value` directive, keyed by lowercased key (last one wins).
        #[serde(default)]
        pub directives: IndexMap<String, String>,
    }

    /* ---------------------------- Content Model ---------------------------- */

    /// Block-level elements, in document order.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum BlockNode {
        /// Level is 1..=6; deeper outlines are clamped.
        Heading {
            level: u8,
            children: Vec<InlineNode>,
        },
        /// Always exactly one physical line.
        Paragraph { children: Vec<InlineNode> },
        /// One inline run per item.
        List { items: Vec<Vec<InlineNode>> },
        CodeBlock {
            language: Option<String>,
            code: String,
        },
        HorizontalRule,
    }

    /// Inline runs. Emphasis holds children for shape only; nesting is never produced.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "value", rename_all = "snake_case")]
    pub enum InlineNode {
        Text(String),
        Bold(Vec<InlineNode>),
        Italic(Vec<InlineNode>),
        Code(String),
        Link {
            url: String,
            label: String,
            /// Targets starting with `http` open in a new context.
            external: bool,
        },
    }

    /* ------------------------------- Logbook ------------------------------- */

    /// One event from a `:LOGBOOK:` drawer.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum LogbookEntry {
        Clock(ClockEntry),
        StateChange(StateChangeEntry),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClockEntry {
        pub start: NaiveDateTime,
        pub end: Option<NaiveDateTime>,
        pub note: Option<String>,
        /// The matched source line.
        pub raw: String,
    }

    impl ClockEntry {
        /// Minutes between start and end; `None` while the clock is still running.
        pub fn minutes(&self) -> Option<i64> {
            self.end.map(|end| (end - self.start).num_minutes())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StateChangeEntry {
        pub from_state: Option<String>,
        pub to_state: String,
        pub date: NaiveDateTime,
        pub note: Option<String>,
        /// The matched source line.
        pub raw: String,
    }

    impl LogbookEntry {
        pub fn note(&self) -> Option<&str> {
            match self {
                LogbookEntry::Clock(c) => c.note.as_deref(),
                LogbookEntry::StateChange(s) => s.note.as_deref(),
            }
        }

        pub fn raw(&self) -> &str {
            match self {
                LogbookEntry::Clock(c) => &c.raw,
                LogbookEntry::StateChange(s) => &s.raw,
            }
        }

        /// Clock start or state-change date.
        pub fn timestamp(&self) -> NaiveDateTime {
            match self {
                LogbookEntry::Clock(c) => c.start,
                LogbookEntry::StateChange(s) => s.date,
            }
        }

        /// Append a continuation line, space-joined with any existing note.
        pub fn append_note(&mut self, text: &str) {
            let note = match self {
                LogbookEntry::Clock(c) => &mut c.note,
                LogbookEntry::StateChange(s) => &mut s.note,
            };
            match note {
                Some(existing) => {
                    existing.push(' ');
                    existing.push_str(text);
                }
                None => *note = Some(text.to_string()),
            }
        }
    }

    /* ---------------------------- Render boundary ---------------------------- */

    /// What the render path hands to the presentation layer: a document or one failure.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "status", rename_all = "snake_case")]
    pub enum RenderOutcome {
        Parsed(Document),
        Failed { message: String },
    }

    impl RenderOutcome {
        pub fn document(&self) -> Option<&Document> {
            match self {
                RenderOutcome::Parsed(doc) => Some(doc),
                RenderOutcome::Failed { .. } => None,
            }
        }

        pub fn is_failed(&self) -> bool {
            matches!(self, RenderOutcome::Failed { .. })
        }
    }

    /* -------------------------------- Options -------------------------------- */

    /// Parser configuration; hosts may load it from JSON.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ParseOptions {
        /// Inputs longer than this many bytes are rejected. `None` disables the check.
        #[serde(default = "ParseOptions::default_max_input_bytes")]
        pub max_input_bytes: Option<usize>,
    }

    impl ParseOptions {
        pub const DEFAULT_MAX_INPUT_BYTES: usize = 4 * 1024 * 1024;

        fn default_max_input_bytes() -> Option<usize> {
            Some(Self::DEFAULT_MAX_INPUT_BYTES)
        }

        pub fn unlimited() -> Self {
            Self {
                max_input_bytes: None,
            }
        }
    }

    impl Default for ParseOptions {
        fn default() -> Self {
            Self {
                max_input_bytes: Self::default_max_input_bytes(),
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// A timestamp no known layout accepts; carries the original string.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unrecognized timestamp {input:?}")]
    pub struct DateParseError {
        pub input: String,
    }

    /// Top-level document failures. Anything milder is absorbed while parsing.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DocumentError {
        #[error("note is {len} bytes, over the {limit} byte limit")]
        TooLarge { len: usize, limit: usize },
    }

}

mod syntax {
    //! Shared nom plumbing for the line grammars.

    use nom::{
        IResult,
        bytes::complete::{tag_no_case, take_till1, take_while},
        character::complete::space0,
        combinator::opt,
        error::{VerboseError, VerboseErrorKind},
    };

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub(crate) fn fail<'a>(i: &'a str, ctx: &'static str) -> nom::Err<VerboseError<&'a str>> {
        nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context(ctx))],
        })
    }

    /// A run of `min..=max` ASCII digits; longer runs are rejected, not split.
    pub(crate) fn digits(min: usize, max: usize) -> impl Fn(&str) -> PResult<'_, &str> {
        move |i: &str| {
            let (rest, out) = take_while(|c: char| c.is_ascii_digit())(i)?;
            if out.len() < min || out.len() > max {
                Err(fail(i, "digit-count"))
            } else {
                Ok((rest, out))
            }
        }
    }

    /// `#+BEGIN_SRC [lang ...]`, returning the language tag if any.
    pub(crate) fn src_open(i: &str) -> PResult<'_, Option<&str>> {
        let (i, _) = tag_no_case("#+BEGIN_SRC")(i)?;
        if !(i.is_empty() || i.starts_with(char::is_whitespace)) {
            return Err(fail(i, "src-open"));
        }
        let (i, _) = space0(i)?;
        opt(take_till1(|c: char| c.is_whitespace()))(i)
    }

    pub(crate) fn is_src_close(trimmed: &str) -> bool {
        trimmed.eq_ignore_ascii_case("#+END_SRC")
    }

    pub(crate) fn is_src_fence(trimmed: &str) -> bool {
        src_open(trimmed).is_ok() || is_src_close(trimmed)
    }
}

pub mod dates {
    //! Lenient timestamp parsing for logbook lines.
    //!
    //! Org timestamps look like `2024-01-01 Mon 10:00`, optionally bracketed. The weekday token
    //! is dropped, then fixed layouts are tried in order (date+time, date+time+seconds, date),
    //! and only then a handful of free-form layouts.

    use crate::core::DateParseError;
    use crate::syntax::{PResult, digits, fail};
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
    use nom::{
        branch::alt,
        character::complete::{char, space1},
        combinator::map_res,
        sequence::{terminated, tuple},
    };

    const WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

    const FALLBACK_DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y/%m/%d %H:%M",
        "%d %b %Y %H:%M",
        "%b %d %Y %H:%M",
    ];

    const FALLBACK_DATE_FORMATS: &[&str] = &["%Y/%m/%d", "%d %b %Y", "%b %d %Y", "%d.%m.%Y"];

    /// Parse a logbook timestamp into a calendar date-time (date-only means midnight).
    pub fn parse_date(input: &str) -> Result<NaiveDateTime, DateParseError> {
        let cleaned = normalize(input);
        if let Some(dt) = parse_fixed(&cleaned) {
            return Ok(dt);
        }
        parse_free_form(input.trim())
            .or_else(|| parse_free_form(&cleaned))
            .ok_or_else(|| DateParseError {
                input: input.to_string(),
            })
    }

    fn normalize(input: &str) -> String {
        strip_brackets(input.trim())
            .split_whitespace()
            .filter(|tok| !is_weekday(tok))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn strip_brackets(s: &str) -> &str {
        for (open, close) in [('[', ']'), ('<', '>')] {
            if let Some(inner) = s.strip_prefix(open).and_then(|r| r.strip_suffix(close)) {
                return inner.trim();
            }
        }
        s
    }

    fn is_weekday(tok: &str) -> bool {
        tok.len() == 3 && WEEKDAYS.iter().any(|d| tok.eq_ignore_ascii_case(d))
    }

    fn parse_fixed(s: &str) -> Option<NaiveDateTime> {
        alt((date_time, date_time_seconds, date_only))(s)
            .ok()
            .map(|(_, dt)| dt)
    }

    fn date_time(i: &str) -> PResult<'_, NaiveDateTime> {
        map_res(
            terminated(
                tuple((ymd, space1, number(1, 2), char(':'), number(2, 2))),
                boundary,
            ),
            |(date, _, h, _, m)| at_time(date, h, m, 0),
        )(i)
    }

    fn date_time_seconds(i: &str) -> PResult<'_, NaiveDateTime> {
        map_res(
            terminated(
                tuple((
                    ymd,
                    space1,
                    number(1, 2),
                    char(':'),
                    number(2, 2),
                    char(':'),
                    number(2, 2),
                )),
                boundary,
            ),
            |(date, _, h, _, m, _, s)| at_time(date, h, m, s),
        )(i)
    }

    fn date_only(i: &str) -> PResult<'_, NaiveDateTime> {
        map_res(terminated(ymd, date_end), |date| at_time(date, 0, 0, 0))(i)
    }

    fn ymd(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((number(4, 4), char('-'), number(2, 2), char('-'), number(2, 2))),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y as i32, m, d).ok_or("invalid date"),
        )(i)
    }

    fn number(min: usize, max: usize) -> impl Fn(&str) -> PResult<'_, u32> {
        move |i: &str| map_res(digits(min, max), |s: &str| s.parse::<u32>())(i)
    }

    /// A timestamp may be followed by a range or repeater cookie, never by glued text.
    fn boundary(i: &str) -> PResult<'_, ()> {
        if i.is_empty() || i.starts_with(char::is_whitespace) || i.starts_with('-') {
            Ok((i, ()))
        } else {
            Err(fail(i, "timestamp-end"))
        }
    }

    /// A bare date may only be followed by a range or a repeater/warning cookie. A time token
    /// here was already rejected by the timed layouts.
    fn date_end(i: &str) -> PResult<'_, ()> {
        if i.is_empty() || i.starts_with('-') {
            return Ok((i, ()));
        }
        let cookie = i.trim_start();
        if i.starts_with(char::is_whitespace) && cookie.starts_with(['+', '-', '.']) {
            Ok((i, ()))
        } else {
            Err(fail(i, "date-end"))
        }
    }

    fn at_time(date: NaiveDate, h: u32, m: u32, s: u32) -> Result<NaiveDateTime, &'static str> {
        NaiveTime::from_hms_opt(h, m, s)
            .map(|t| date.and_time(t))
            .ok_or("invalid time")
    }

    fn parse_free_form(s: &str) -> Option<NaiveDateTime> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.naive_local());
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
            return Some(dt.naive_local());
        }
        FALLBACK_DATETIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .or_else(|| {
                FALLBACK_DATE_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
    }

}

pub mod metadata {
    //! Document-level directives and the leading property drawer.

    use crate::core::DocumentMetadata;
    use crate::syntax::{PResult, is_src_fence};
    use log::debug;
    use nom::{
        bytes::complete::{tag, take_while1},
        character::complete::{char, not_line_ending, space0},
    };

    /// Where we are relative to `:PROPERTIES:` drawers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PropertyDrawer {
        NotSeen,
        Capturing,
        Done,
        /// A repeated drawer; its lines are dropped unread.
        Skipping,
    }

    /// Split `raw` into metadata and the body text handed to the block parser.
    ///
    /// Never fails: anything that does not match a directive shape passes through as body text.
    pub fn extract_metadata(raw: &str) -> (DocumentMetadata, String) {
        let mut meta = DocumentMetadata::default();
        let mut body: Vec<&str> = Vec::new();
        let mut drawer = PropertyDrawer::NotSeen;

        for line in raw.lines() {
            let trimmed = line.trim();

            match drawer {
                PropertyDrawer::Capturing => {
                    if trimmed == ":END:" {
                        drawer = PropertyDrawer::Done;
                    } else if let Ok((_, (key, value))) = property(trimmed) {
                        if key.eq_ignore_ascii_case("ID") {
                            meta.id = Some(value.to_string());
                        }
                    }
                    continue;
                }
                PropertyDrawer::Skipping => {
                    if trimmed == ":END:" {
                        drawer = PropertyDrawer::Done;
                    }
                    continue;
                }
                PropertyDrawer::NotSeen | PropertyDrawer::Done => {}
            }

            if trimmed == ":PROPERTIES:" {
                drawer = if drawer == PropertyDrawer::NotSeen {
                    PropertyDrawer::Capturing
                } else {
                    debug!("event=metadata_skip reason=repeated_property_drawer");
                    PropertyDrawer::Skipping
                };
                continue;
            }

            if drawer == PropertyDrawer::Done && is_stray_property_line(trimmed) {
                continue;
            }

            let lead = line.trim_start();
            if lead.starts_with("#+") {
                if is_src_fence(trimmed) {
                    body.push(line);
                } else if let Ok((_, (key, value))) = directive(lead) {
                    apply_directive(&mut meta, key, value);
                }
                continue;
            }

            body.push(line);
        }

        (meta, body.join("\n"))
    }

    fn apply_directive(meta: &mut DocumentMetadata, key: &str, value: &str) {
        match key.to_ascii_lowercase().as_str() {
            "title" => {
                if meta.title.is_none() {
                    meta.title = Some(value.to_string());
                } else {
                    debug!("event=metadata_skip reason=repeated_title");
                }
            }
            "category" => meta.category = Some(value.to_string()),
            "author" => meta.author = Some(value.to_string()),
            "date" => meta.date = Some(value.to_string()),
            "tags" => {
                meta.tags = value.split_whitespace().map(str::to_string).collect();
            }
            other => {
                meta.directives.insert(other.to_string(), value.to_string());
            }
        }
    }

    fn is_stray_property_line(trimmed: &str) -> bool {
        trimmed == ":END:"
            || property(trimmed)
                .map(|(_, (key, _))| key.eq_ignore_ascii_case("ID"))
                .unwrap_or(false)
    }

    fn key_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    }

    fn directive(i: &str) -> PResult<'_, (&str, &str)> {
        // #+key: value
        let (i, _) = tag("#+")(i)?;
        key_value(i)
    }

    fn property(i: &str) -> PResult<'_, (&str, &str)> {
        // :KEY: value
        let (i, _) = char(':')(i)?;
        key_value(i)
    }

    fn key_value(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, key) = take_while1(key_char)(i)?;
        let (i, _) = char(':')(i)?;
        let (i, _) = space0(i)?;
        let (i, value) = not_line_ending(i)?;
        Ok((i, (key, value.trim())))
    }

}

pub mod inline {
    //! Inline markup: `*bold*`, `/italic/`, `=code=`, `[[url][label]]` and `[[url]]`.
    //!
    //! One left-to-right scan cuts a line into a flat token stream and a builder turns tokens
    //! into nodes. Span contents are never rescanned, so markup does not nest and a delimiter
    //! consumed by one span cannot start another. At any position a link is tried first, then
    //! bold, italic and code. A span must close on the same line with non-empty content that
    //! does not open with whitespace; anything else stays literal text.

    use crate::core::InlineNode;
    use crate::syntax::{PResult, fail};
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_till1, take_until},
        character::complete::char,
        combinator::{map, value},
        sequence::delimited,
    };

    /// Flat scanner output; borrowed slices of the input line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Token<'a> {
        Text(&'a str),
        Bold(&'a str),
        Italic(&'a str),
        Code(&'a str),
        Link { url: &'a str, label: Option<&'a str> },
    }

    /// Parse one line into inline nodes.
    pub fn parse_inlines(line: &str) -> Vec<InlineNode> {
        build(tokenize(line))
    }

    pub fn tokenize(line: &str) -> Vec<Token<'_>> {
        let mut out = Vec::new();
        let mut text_start = 0;
        let mut pos = 0;
        while pos < line.len() {
            let rest = &line[pos..];
            if rest.starts_with(['[', '*', '/', '=']) {
                if let Ok((remaining, token)) = span_at(rest) {
                    if text_start < pos {
                        out.push(Token::Text(&line[text_start..pos]));
                    }
                    out.push(token);
                    pos = line.len() - remaining.len();
                    text_start = pos;
                    continue;
                }
            }
            pos += rest.chars().next().map_or(1, char::len_utf8);
        }
        if text_start < line.len() {
            out.push(Token::Text(&line[text_start..]));
        }
        out
    }

    pub fn build(tokens: Vec<Token<'_>>) -> Vec<InlineNode> {
        let mut out: Vec<InlineNode> = Vec::with_capacity(tokens.len());
        for token in tokens {
            let node = match token {
                Token::Text(t) => {
                    if let Some(InlineNode::Text(prev)) = out.last_mut() {
                        prev.push_str(t);
                        continue;
                    }
                    InlineNode::Text(t.to_string())
                }
                Token::Bold(t) => InlineNode::Bold(vec![InlineNode::Text(t.to_string())]),
                Token::Italic(t) => InlineNode::Italic(vec![InlineNode::Text(t.to_string())]),
                Token::Code(t) => InlineNode::Code(t.to_string()),
                Token::Link { url, label } => {
                    let url = url.trim();
                    let label = label.map(str::trim).filter(|l| !l.is_empty()).unwrap_or(url);
                    InlineNode::Link {
                        url: url.to_string(),
                        label: label.to_string(),
                        external: url.starts_with("http"),
                    }
                }
            };
            out.push(node);
        }
        out
    }

    fn span_at(i: &str) -> PResult<'_, Token<'_>> {
        alt((
            link,
            delimited_span('*', Token::Bold),
            delimited_span('/', Token::Italic),
            delimited_span('=', Token::Code),
        ))(i)
    }

    fn delimited_span<'a>(
        delim: char,
        make: fn(&'a str) -> Token<'a>,
    ) -> impl Fn(&'a str) -> PResult<'a, Token<'a>> {
        move |i: &'a str| {
            let (i, _) = char(delim)(i)?;
            let (i, body) = take_till1(move |c: char| c == delim)(i)?;
            if body.starts_with(char::is_whitespace) {
                return Err(fail(i, "span-open"));
            }
            let (i, _) = char(delim)(i)?;
            Ok((i, make(body)))
        }
    }

    fn link(i: &str) -> PResult<'_, Token<'_>> {
        let (i, _) = tag("[[")(i)?;
        let (i, url) = take_till1(|c: char| c == ']')(i)?;
        let (i, label) = alt((
            map(delimited(tag("]["), take_until("]]"), tag("]]")), Some),
            value(None, tag("]]")),
        ))(i)?;
        Ok((i, Token::Link { url, label }))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn text(s: &str) -> InlineNode {
            InlineNode::Text(s.to_string())
        }

        #[test]
        fn each_marker_yields_one_node() {
            assert_eq!(
                parse_inlines("*bold*"),
                vec![InlineNode::Bold(vec![text("bold")])]
            );
            assert_eq!(
                parse_inlines("/italic/"),
                vec![InlineNode::Italic(vec![text("italic")])]
            );
            assert_eq!(parse_inlines("=code="), vec![InlineNode::Code("code".into())]);
        }

        #[test]
        fn plain_line_is_single_text() {
            assert_eq!(parse_inlines("just words"), vec![text("just words")]);
            assert_eq!(parse_inlines("*"), vec![text("*")]);
            assert_eq!(parse_inlines("2 * 3 * 4"), vec![text("2 * 3 * 4")]);
            assert!(parse_inlines("").is_empty());
        }

        #[test]
        fn mixed_markup_keeps_order() {
            let nodes = parse_inlines("use =cargo= for *fast* builds");
            assert_eq!(
                nodes,
                vec![
                    text("use "),
                    InlineNode::Code("cargo".into()),
                    text(" for "),
                    InlineNode::Bold(vec![text("fast")]),
                    text(" builds"),
                ]
            );
        }

        #[test]
        fn spans_do_not_nest() {
            let nodes = parse_inlines("*bold /not italic/*");
            assert_eq!(nodes, vec![InlineNode::Bold(vec![text("bold /not italic/")])]);
        }

        #[test]
        fn links_classify_external_targets() {
            let nodes =
                parse_inlines("see [[https://example.com/a/b][the site]] or [[notes/todo]]");
            assert_eq!(
                nodes,
                vec![
                    text("see "),
                    InlineNode::Link {
                        url: "https://example.com/a/b".into(),
                        label: "the site".into(),
                        external: true,
                    },
                    text(" or "),
                    InlineNode::Link {
                        url: "notes/todo".into(),
                        label: "notes/todo".into(),
                        external: false,
                    },
                ]
            );
        }

        #[test]
        fn unclosed_link_is_text() {
            assert_eq!(parse_inlines("[[half open"), vec![text("[[half open")]);
        }

        #[test]
        fn tokenizer_emits_flat_stream() {
            assert_eq!(
                tokenize("a *b* c"),
                vec![Token::Text("a "), Token::Bold("b"), Token::Text(" c")]
            );
        }

        #[test]
        fn multibyte_text_is_preserved() {
            assert_eq!(
                parse_inlines("café *fort* ünd"),
                vec![
                    text("café "),
                    InlineNode::Bold(vec![text("fort")]),
                    text(" ünd"),
                ]
            );
        }
    }
}

pub mod blocks {
    //! Line-oriented block parser.
    //!
    //! Each physical line is dispatched in a fixed order: code fence, heading, list item,
    //! horizontal rule, blank, paragraph. Lists and code blocks are buffered until something
    //! else flushes them.

    use crate::core::{BlockNode, InlineNode};
    use crate::inline::parse_inlines;
    use crate::syntax::{PResult, is_src_close, src_open};
    use nom::{
        branch::alt,
        bytes::complete::tag,
        character::complete::{char, digit1, space1},
        combinator::{recognize, rest},
        sequence::{preceded, tuple},
    };

    pub const MAX_HEADING_LEVEL: u8 = 6;

    /// Parse the cleaned body (metadata already stripped) into blocks.
    pub fn parse_blocks(body: &str) -> Vec<BlockNode> {
        let mut scanner = BlockScanner::default();
        for line in body.lines() {
            scanner.feed(line);
        }
        scanner.finish()
    }

    #[derive(Debug, Default)]
    struct BlockScanner {
        blocks: Vec<BlockNode>,
        list: Option<Vec<Vec<InlineNode>>>,
        code: Option<PendingCode>,
    }

    #[derive(Debug)]
    struct PendingCode {
        language: Option<String>,
        lines: Vec<String>,
    }

    impl PendingCode {
        fn into_block(self) -> BlockNode {
            BlockNode::CodeBlock {
                language: self.language,
                code: self.lines.join("\n"),
            }
        }
    }

    impl BlockScanner {
        fn feed(&mut self, line: &str) {
            let trimmed = line.trim();

            if let Some(mut code) = self.code.take() {
                if is_src_close(trimmed) {
                    self.blocks.push(code.into_block());
                } else {
                    code.lines.push(line.to_string());
                    self.code = Some(code);
                }
                return;
            }

            if let Ok((_, language)) = src_open(trimmed) {
                self.flush_list();
                self.code = Some(PendingCode {
                    language: language.map(str::to_string),
                    lines: Vec::new(),
                });
                return;
            }

            if line.starts_with('*') {
                self.flush_list();
                let (level, text) = heading(line);
                self.blocks.push(BlockNode::Heading {
                    level,
                    children: parse_inlines(text),
                });
                return;
            }

            if let Ok((_, item)) = list_item(trimmed) {
                self.list
                    .get_or_insert_with(Vec::new)
                    .push(parse_inlines(item.trim()));
                return;
            }

            if is_rule(trimmed) {
                self.flush_list();
                self.blocks.push(BlockNode::HorizontalRule);
                return;
            }

            self.flush_list();
            if !trimmed.is_empty() {
                self.blocks.push(BlockNode::Paragraph {
                    children: parse_inlines(trimmed),
                });
            }
        }

        fn flush_list(&mut self) {
            if let Some(items) = self.list.take() {
                self.blocks.push(BlockNode::List { items });
            }
        }

        /// Flush pending state; an unterminated code block keeps what it collected.
        fn finish(mut self) -> Vec<BlockNode> {
            self.flush_list();
            if let Some(code) = self.code.take() {
                self.blocks.push(code.into_block());
            }
            self.blocks
        }
    }

    /// Level from the leading stars, capped; the rest is the heading text.
    fn heading(line: &str) -> (u8, &str) {
        let text = line.trim_start_matches('*');
        let stars = line.len() - text.len();
        (stars.min(MAX_HEADING_LEVEL as usize) as u8, text.trim())
    }

    fn list_item(i: &str) -> PResult<'_, &str> {
        // "- text" or "12. text"
        preceded(
            alt((tag("- "), recognize(tuple((digit1, char('.'), space1))))),
            rest,
        )(i)
    }

    fn is_rule(trimmed: &str) -> bool {
        trimmed.len() >= 3 && trimmed.bytes().all(|b| b == b'-')
    }

}

pub mod logbook {
    //! `:LOGBOOK:` drawer scanning.
    //!
    //! Each line is classified into an [`Event`]; [`step`] is the whole state machine and
    //! decides when a pending entry is frozen. Entries come back most recent first.

    use crate::core::{ClockEntry, DateParseError, LogbookEntry, StateChangeEntry};
    use crate::dates::parse_date;
    use crate::syntax::PResult;
    use log::{debug, warn};
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_till, take_till1},
        character::complete::{char, not_line_ending, space0, space1},
        combinator::{opt, verify},
        sequence::{delimited, preceded, terminated, tuple},
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum State {
        Outside,
        InsideNoPending,
        InsidePending(LogbookEntry),
    }

    impl State {
        pub fn is_inside(&self) -> bool {
            !matches!(self, State::Outside)
        }
    }

    /// A classified line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Open,
        Close,
        /// A clock or state-change line that parsed completely.
        Start(LogbookEntry),
        Note(String),
        Skip,
    }

    /// Extract logbook entries from the whole note, most recent first.
    ///
    /// Total over all input: missing, empty or malformed drawers give `[]`.
    pub fn parse_logbook(raw: &str) -> Vec<LogbookEntry> {
        let mut state = State::Outside;
        let mut entries = Vec::new();
        for line in raw.lines() {
            let event = classify(line, state.is_inside());
            let (next, frozen) = step(state, event);
            entries.extend(frozen);
            state = next;
        }
        entries.extend(finish(state));
        entries.reverse();
        entries
    }

    /// Transition table. Returns the next state and the entry frozen by this event, if any.
    pub fn step(state: State, event: Event) -> (State, Option<LogbookEntry>) {
        match (state, event) {
            (State::Outside, Event::Open) => (State::InsideNoPending, None),
            (State::Outside, _) => (State::Outside, None),

            (State::InsideNoPending, Event::Close) => (State::Outside, None),
            (State::InsidePending(entry), Event::Close) => (State::Outside, Some(entry)),

            (State::InsideNoPending, Event::Start(next)) => (State::InsidePending(next), None),
            (State::InsidePending(prev), Event::Start(next)) => {
                (State::InsidePending(next), Some(prev))
            }

            (State::InsidePending(mut entry), Event::Note(text)) => {
                entry.append_note(&text);
                (State::InsidePending(entry), None)
            }

            (state, Event::Note(_) | Event::Skip | Event::Open) => (state, None),
        }
    }

    /// End of input: an unterminated drawer still yields its pending entry.
    pub fn finish(state: State) -> Option<LogbookEntry> {
        match state {
            State::InsidePending(entry) => Some(entry),
            State::Outside | State::InsideNoPending => None,
        }
    }

    /// Classify one line. Outside a drawer only `:LOGBOOK:` matters.
    pub fn classify(line: &str, inside: bool) -> Event {
        let trimmed = line.trim();
        if trimmed == ":LOGBOOK:" {
            return Event::Open;
        }
        if !inside || trimmed.is_empty() {
            return Event::Skip;
        }
        if trimmed == ":END:" {
            return Event::Close;
        }
        if let Ok((_, parts)) = clock_line(trimmed) {
            return start_or_skip(parts.into_entry(trimmed));
        }
        if let Ok((_, parts)) = state_line(trimmed) {
            return start_or_skip(parts.into_entry(trimmed));
        }
        if trimmed.starts_with("CLOCK:") {
            debug!("event=logbook_skip reason=unmatched_clock line={trimmed:?}");
            return Event::Skip;
        }
        let note = trimmed.strip_prefix("- ").unwrap_or(trimmed).trim_start();
        Event::Note(note.to_string())
    }

    fn start_or_skip(result: Result<LogbookEntry, DateParseError>) -> Event {
        match result {
            Ok(entry) => Event::Start(entry),
            Err(err) => {
                warn!("event=logbook_skip reason=date_parse error={err}");
                Event::Skip
            }
        }
    }

    /* ------------------------------ Line grammar ------------------------------ */

    struct ClockParts<'a> {
        start: &'a str,
        end: Option<&'a str>,
        duration: Option<&'a str>,
    }

    impl ClockParts<'_> {
        fn into_entry(self, raw: &str) -> Result<LogbookEntry, DateParseError> {
            let start = parse_date(self.start)?;
            let end = self.end.map(parse_date).transpose()?;
            Ok(LogbookEntry::Clock(ClockEntry {
                start,
                end,
                note: self.duration.map(|d| format!("Duration: {d}")),
                raw: raw.to_string(),
            }))
        }
    }

    struct StateParts<'a> {
        to: &'a str,
        from: Option<&'a str>,
        date: &'a str,
    }

    impl StateParts<'_> {
        fn into_entry(self, raw: &str) -> Result<LogbookEntry, DateParseError> {
            let date = parse_date(self.date)?;
            Ok(LogbookEntry::StateChange(StateChangeEntry {
                from_state: self.from.filter(|s| !s.is_empty()).map(str::to_string),
                to_state: self.to.to_string(),
                date,
                note: None,
                raw: raw.to_string(),
            }))
        }
    }

    fn bullet(i: &str) -> PResult<'_, char> {
        terminated(char('-'), space1)(i)
    }

    fn bracketed(i: &str) -> PResult<'_, &str> {
        alt((
            delimited(char('['), take_till1(|c: char| c == ']'), char(']')),
            delimited(char('<'), take_till1(|c: char| c == '>'), char('>')),
        ))(i)
    }

    fn quoted(i: &str) -> PResult<'_, &str> {
        delimited(char('"'), take_till(|c: char| c == '"'), char('"'))(i)
    }

    /// An unbracketed date runs to end of line, minus a trailing `\\` line break.
    fn bare_date(i: &str) -> PResult<'_, &str> {
        let (i, date) = verify(not_line_ending, |s: &str| !s.trim().is_empty())(i)?;
        Ok((i, date.trim().trim_end_matches('\\').trim_end()))
    }

    /// `[- ]CLOCK: [start][--[end]][ => duration]`
    fn clock_line(i: &str) -> PResult<'_, ClockParts<'_>> {
        let (i, _) = opt(bullet)(i)?;
        let (i, _) = tag("CLOCK:")(i)?;
        let (i, _) = space0(i)?;
        let (i, start) = bracketed(i)?;
        let (i, end) = opt(preceded(tuple((space0, tag("--"), space0)), bracketed))(i)?;
        let (i, duration) = opt(preceded(
            tuple((space0, tag("=>"), space0)),
            not_line_ending,
        ))(i)?;
        Ok((
            i,
            ClockParts {
                start,
                end,
                duration: duration.map(str::trim).filter(|d| !d.is_empty()),
            },
        ))
    }

    /// `[- ]State "TO" from ["FROM"] [date]` with the date bracketed or bare.
    fn state_line(i: &str) -> PResult<'_, StateParts<'_>> {
        let (i, _) = opt(bullet)(i)?;
        let (i, _) = tag("State")(i)?;
        let (i, _) = space1(i)?;
        let (i, to) = quoted(i)?;
        let (i, _) = space1(i)?;
        let (i, _) = tag("from")(i)?;
        let (i, _) = space0(i)?;
        let (i, from) = opt(quoted)(i)?;
        let (i, _) = space0(i)?;
        let (i, date) = alt((bracketed, bare_date))(i)?;
        Ok((i, StateParts { to, from, date }))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::format::format_logbook_date;

        fn clock_start(entry: &LogbookEntry) -> String {
            match entry {
                LogbookEntry::Clock(c) => format_logbook_date(&c.start),
                other => panic!("expected clock, got {other:?}"),
            }
        }

        #[test]
        fn no_drawer_or_empty_drawer_is_empty() {
            assert!(parse_logbook("").is_empty());
            assert!(parse_logbook(":LOGBOOK:\n:END:").is_empty());
            assert!(parse_logbook("* Heading\nCLOCK: [2024-01-01 Mon 10:00]").is_empty());
        }

        #[test]
        fn state_changes_come_back_most_recent_first() {
            let raw = r#":LOGBOOK:
State "DONE" from "TODO" 2025-08-30 Fri 20:00
State "TODO" from "" 2025-08-29 Thu 09:15
:END:"#;
            let entries = parse_logbook(raw);
            assert_eq!(entries.len(), 2);
            match (&entries[0], &entries[1]) {
                (LogbookEntry::StateChange(first), LogbookEntry::StateChange(second)) => {
                    assert_eq!(first.to_state, "TODO");
                    assert_eq!(first.from_state, None);
                    assert_eq!(second.to_state, "DONE");
                    assert_eq!(second.from_state.as_deref(), Some("TODO"));
                }
                other => panic!("unexpected entries {other:?}"),
            }
        }

        #[test]
        fn clock_lines_keep_their_timestamps() {
            let raw = r#"* Task
:LOGBOOK:
CLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 10:30] =>  1:30
- CLOCK: [2024-01-16 Tue 14:00]--[2024-01-16 Tue 14:45] =>  0:45
:END:
"#;
            let entries = parse_logbook(raw);
            assert_eq!(entries.len(), 2);
            assert_eq!(clock_start(&entries[0]), "2024-01-16 14:00");
            assert_eq!(clock_start(&entries[1]), "2024-01-15 09:00");
            match &entries[1] {
                LogbookEntry::Clock(c) => {
                    assert_eq!(
                        c.end.map(|e| format_logbook_date(&e)).as_deref(),
                        Some("2024-01-15 10:30")
                    );
                    assert_eq!(c.note.as_deref(), Some("Duration: 1:30"));
                    assert_eq!(c.minutes(), Some(90));
                }
                other => panic!("expected clock, got {other:?}"),
            }
        }

        #[test]
        fn running_clock_has_no_end() {
            let entries = parse_logbook(":LOGBOOK:\n  CLOCK: [2024-01-15 Mon 09:00]\n:END:");
            match entries.as_slice() {
                [LogbookEntry::Clock(c)] => {
                    assert!(c.end.is_none());
                    assert!(c.note.is_none());
                }
                other => panic!("unexpected entries {other:?}"),
            }
        }

        #[test]
        fn malformed_clock_is_skipped_without_disturbing_others() {
            let raw = r#":LOGBOOK:
CLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 10:30] =>  1:30
CLOCK: [not-a-date]
- State "DONE" from "TODO" [2024-01-15 Mon 11:00]
:END:"#;
            let entries = parse_logbook(raw);
            assert_eq!(entries.len(), 2);
            assert!(matches!(&entries[0], LogbookEntry::StateChange(s) if s.to_state == "DONE"));
            assert_eq!(entries[1].note(), Some("Duration: 1:30"));
        }

        #[test]
        fn clock_with_impossible_end_time_is_dropped() {
            let raw = r#":LOGBOOK:
CLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 25:00] =>  16:00
:END:"#;
            assert!(parse_logbook(raw).is_empty());
        }

        #[test]
        fn state_change_with_bad_date_is_skipped() {
            let raw = r#":LOGBOOK:
- State "DONE" from "TODO" [someday]
- State "NEXT" from "TODO" [2024-01-15 Mon 11:00]
:END:"#;
            let entries = parse_logbook(raw);
            match entries.as_slice() {
                [LogbookEntry::StateChange(s)] => assert_eq!(s.to_state, "NEXT"),
                other => panic!("unexpected entries {other:?}"),
            }
        }

        #[test]
        fn pending_entry_keeps_collecting_notes_after_a_skipped_line() {
            let raw = r#":LOGBOOK:
CLOCK: [2024-01-15 Mon 09:00]
CLOCK: [not-a-date]
- after bad
:END:"#;
            let entries = parse_logbook(raw);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].raw(), "CLOCK: [2024-01-15 Mon 09:00]");
            assert_eq!(entries[0].note(), Some("after bad"));
        }

        #[test]
        fn separate_drawers_accumulate_into_one_list() {
            let raw = r#"* First
:LOGBOOK:
CLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 09:30] =>  0:30
:END:
* Second
:LOGBOOK:
State "A" from "B" [2024-01-16 Tue 10:00]
:END:"#;
            let entries = parse_logbook(raw);
            let raws: Vec<&str> = entries.iter().map(LogbookEntry::raw).collect();
            assert_eq!(
                raws,
                vec![
                    r#"State "A" from "B" [2024-01-16 Tue 10:00]"#,
                    "CLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 09:30] =>  0:30",
                ]
            );
        }

        #[test]
        fn continuation_lines_become_notes() {
            let raw = r#":LOGBOOK:
- State "DONE" from "NEXT" [2024-02-01 Thu 18:00] \\
  - Wrapped up
  the review.
CLOCK: garbage
:END:"#;
            let entries = parse_logbook(raw);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].note(), Some("Wrapped up the review."));
        }

        #[test]
        fn notes_without_a_pending_entry_are_dropped() {
            let entries =
                parse_logbook(":LOGBOOK:\nstray note\nCLOCK: [2024-01-15 Mon 09:00]\n:END:");
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].note(), None);
        }

        #[test]
        fn unterminated_drawer_flushes_pending_entry() {
            let entries =
                parse_logbook(":LOGBOOK:\nState \"WAIT\" from \"TODO\" [2024-03-01 Fri 08:00]");
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].raw(), "State \"WAIT\" from \"TODO\" [2024-03-01 Fri 08:00]");
        }

        #[test]
        fn state_without_quoted_origin() {
            let entries = parse_logbook(
                r#":LOGBOOK:
- State "TODO"       from              [2024-03-01 Fri 08:00]
:END:"#,
            );
            match entries.as_slice() {
                [LogbookEntry::StateChange(s)] => {
                    assert_eq!(s.to_state, "TODO");
                    assert_eq!(s.from_state, None);
                }
                other => panic!("unexpected entries {other:?}"),
            }
        }

        #[test]
        fn transition_table_flush_points() {
            let entry = match classify("CLOCK: [2024-01-15 Mon 09:00]", true) {
                Event::Start(e) => e,
                other => panic!("expected start, got {other:?}"),
            };

            assert_eq!(step(State::Outside, Event::Note("x".into())), (State::Outside, None));
            assert_eq!(step(State::Outside, Event::Open), (State::InsideNoPending, None));
            assert_eq!(step(State::InsideNoPending, Event::Close), (State::Outside, None));
            assert_eq!(
                step(State::InsideNoPending, Event::Start(entry.clone())),
                (State::InsidePending(entry.clone()), None)
            );
            assert_eq!(
                step(State::InsidePending(entry.clone()), Event::Close),
                (State::Outside, Some(entry.clone()))
            );
            assert_eq!(
                step(State::InsidePending(entry.clone()), Event::Skip),
                (State::InsidePending(entry.clone()), None)
            );
            let (next, frozen) =
                step(State::InsidePending(entry.clone()), Event::Start(entry.clone()));
            assert_eq!(frozen, Some(entry.clone()));
            assert!(matches!(next, State::InsidePending(_)));
            assert_eq!(finish(State::InsidePending(entry.clone())), Some(entry));
            assert_eq!(finish(State::InsideNoPending), None);
        }

        #[test]
        fn classification_outside_a_drawer() {
            assert_eq!(classify("  :LOGBOOK:  ", false), Event::Open);
            assert_eq!(classify(":END:", false), Event::Skip);
            assert_eq!(classify("- note", false), Event::Skip);
            assert_eq!(classify("- note", true), Event::Note("note".into()));
        }
    }
}

pub mod format {
    //! Display helpers for parsed notes and logbooks.

    use crate::core::{InlineNode, LogbookEntry};
    use chrono::NaiveDateTime;

    pub const LOGBOOK_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

    pub fn format_logbook_date(dt: &NaiveDateTime) -> String {
        dt.format(LOGBOOK_DATE_FORMAT).to_string()
    }

    /// Minutes as `H:MM`, the way clock durations are written.
    pub fn format_minutes(minutes: i64) -> String {
        let sign = if minutes < 0 { "-" } else { "" };
        let abs = minutes.abs();
        format!("{}{}:{:02}", sign, abs / 60, abs % 60)
    }

    /// Sum of closed clock intervals.
    pub fn total_clocked_minutes(entries: &[LogbookEntry]) -> i64 {
        entries
            .iter()
            .filter_map(|e| match e {
                LogbookEntry::Clock(c) => c.minutes(),
                LogbookEntry::StateChange(_) => None,
            })
            .sum()
    }

    /// One human-readable line per entry.
    pub fn entry_summary(entry: &LogbookEntry) -> String {
        let mut buf = match entry {
            LogbookEntry::Clock(c) => {
                let mut buf = format!("CLOCK {}", format_logbook_date(&c.start));
                match (c.end, c.minutes()) {
                    (Some(end), Some(mins)) => buf.push_str(&format!(
                        " -> {} ({})",
                        format_logbook_date(&end),
                        format_minutes(mins)
                    )),
                    _ => buf.push_str(" -> running"),
                }
                buf
            }
            LogbookEntry::StateChange(s) => format!(
                "STATE {} -> {} @ {}",
                s.from_state.as_deref().unwrap_or("(none)"),
                s.to_state,
                format_logbook_date(&s.date)
            ),
        };
        if let Some(note) = entry.note() {
            buf.push_str(" | ");
            buf.push_str(note);
        }
        buf
    }

    /// Render a plain text approximation of an inline run (useful for titles and outlines).
    pub fn plain_text(nodes: &[InlineNode]) -> String {
        fn rec(xs: &[InlineNode], out: &mut String) {
            for x in xs {
                match x {
                    InlineNode::Text(t) | InlineNode::Code(t) => out.push_str(t),
                    InlineNode::Bold(children) | InlineNode::Italic(children) => rec(children, out),
                    InlineNode::Link { label, .. } => out.push_str(label),
                }
            }
        }
        let mut s = String::new();
        rec(nodes, &mut s);
        s
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::dates::parse_date;
        use crate::inline::parse_inlines;
        use crate::logbook::parse_logbook;

        #[test]
        fn logbook_date_round_trips() {
            let dt = parse_date("2024-01-15 Mon 10:30").expect("date");
            assert_eq!(format_logbook_date(&dt), "2024-01-15 10:30");
        }

        #[test]
        fn minutes_render_as_hours_and_minutes() {
            assert_eq!(format_minutes(90), "1:30");
            assert_eq!(format_minutes(5), "0:05");
            assert_eq!(format_minutes(-30), "-0:30");
        }

        #[test]
        fn summaries_and_totals() {
            let raw = r#":LOGBOOK:
CLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 10:30] =>  1:30
CLOCK: [2024-01-16 Tue 09:00]
State "DONE" from "TODO" [2024-01-16 Tue 12:00]
:END:"#;
            let entries = parse_logbook(raw);
            assert_eq!(total_clocked_minutes(&entries), 90);
            let lines: Vec<String> = entries.iter().map(entry_summary).collect();
            assert_eq!(
                lines,
                vec![
                    "STATE TODO -> DONE @ 2024-01-16 12:00".to_string(),
                    "CLOCK 2024-01-16 09:00 -> running".to_string(),
                    "CLOCK 2024-01-15 09:00 -> 2024-01-15 10:30 (1:30) | Duration: 1:30"
                        .to_string(),
                ]
            );
        }

        #[test]
        fn plain_text_flattens_markup() {
            let nodes = parse_inlines("a *b* =c= [[http://x.org][d]]");
            assert_eq!(plain_text(&nodes), "a b c d");
        }
    }
}

pub mod document {
    //! Public entry points and the render-path failure boundary.

    use crate::blocks::parse_blocks;
    use crate::core::{Document, DocumentError, ParseOptions, RenderOutcome};
    use crate::metadata::extract_metadata;
    use log::{debug, error, warn};
    use std::any::Any;
    use std::panic::{self, AssertUnwindSafe};

    const MAX_FAILURE_MESSAGE_CHARS: usize = 160;

    /// Parse a note with default options.
    pub fn parse_document(raw: &str) -> Result<Document, DocumentError> {
        parse_document_with_options(raw, &ParseOptions::default())
    }

    pub fn parse_document_with_options(
        raw: &str,
        options: &ParseOptions,
    ) -> Result<Document, DocumentError> {
        if let Some(limit) = options.max_input_bytes {
            if raw.len() > limit {
                return Err(DocumentError::TooLarge {
                    len: raw.len(),
                    limit,
                });
            }
        }
        let (metadata, body) = extract_metadata(raw);
        let blocks = parse_blocks(&body);
        debug!(
            "event=document_parsed blocks={} tags={}",
            blocks.len(),
            metadata.tags.len()
        );
        Ok(Document { metadata, blocks })
    }

    pub fn render_document(raw: &str) -> RenderOutcome {
        render_document_with_options(raw, &ParseOptions::default())
    }

    /// Render-path entry: any failure, including a panic inside the parser, becomes a single
    /// `Failed` outcome and nothing partial is returned with it.
    pub fn render_document_with_options(raw: &str, options: &ParseOptions) -> RenderOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| parse_document_with_options(raw, options))) {
            Ok(Ok(doc)) => RenderOutcome::Parsed(doc),
            Ok(Err(err)) => {
                warn!("event=render_failed reason=document error={err}");
                RenderOutcome::Failed {
                    message: err.to_string(),
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("event=render_failed reason=panic payload={message}");
                RenderOutcome::Failed { message }
            }
        }
    }

    fn panic_message(payload: &(dyn Any + Send)) -> String {
        let raw = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "parser panicked".to_string()
        };
        let normalized = raw.replace(['\n', '\r'], " ");
        let mut truncated: String = normalized.chars().take(MAX_FAILURE_MESSAGE_CHARS).collect();
        if normalized.chars().count() > MAX_FAILURE_MESSAGE_CHARS {
            truncated.push_str("...");
        }
        truncated
    }

}

pub mod cache {
    //! Memoized render results keyed by the raw note text.
    //!
    //! Parsing is pure, so a host may keep one of these per view to skip re-parsing on
    //! re-render. It is optional; nothing in the parser depends on it.

    use crate::core::{ParseOptions, RenderOutcome};
    use crate::document::render_document_with_options;
    use indexmap::IndexMap;
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct RenderCache {
        capacity: usize,
        options: ParseOptions,
        entries: IndexMap<String, Arc<RenderOutcome>>,
    }

    impl RenderCache {
        pub const DEFAULT_CAPACITY: usize = 64;

        pub fn new(capacity: usize) -> Self {
            Self::with_options(capacity, ParseOptions::default())
        }

        pub fn with_options(capacity: usize, options: ParseOptions) -> Self {
            Self {
                capacity: capacity.max(1),
                options,
                entries: IndexMap::new(),
            }
        }

        /// Cached outcome for `raw`, rendering it on a miss. Evicts the oldest entry when full.
        pub fn get_or_render(&mut self, raw: &str) -> Arc<RenderOutcome> {
            if let Some(hit) = self.entries.get(raw) {
                return Arc::clone(hit);
            }
            let outcome = Arc::new(render_document_with_options(raw, &self.options));
            if self.entries.len() >= self.capacity {
                self.entries.shift_remove_index(0);
            }
            self.entries.insert(raw.to_string(), Arc::clone(&outcome));
            outcome
        }

        pub fn contains(&self, raw: &str) -> bool {
            self.entries.contains_key(raw)
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub fn clear(&mut self) {
            self.entries.clear();
        }
    }

    impl Default for RenderCache {
        fn default() -> Self {
            Self::new(Self::DEFAULT_CAPACITY)
        }
    }

}

pub use dates::parse_date;
pub use document::{
    parse_document, parse_document_with_options, render_document, render_document_with_options,
};
pub use format::format_logbook_date;
pub use logbook::parse_logbook;
