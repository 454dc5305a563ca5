// entity.rs -- entity lump text: tokenizing, key/value blocks, brush-model references
//
// The entity lump is brace-delimited blocks of quoted "key" "value" pairs.
// Brush entities reference a model by a "model" value of the form "*N".

use crate::mathlib::Vec3;

/// Model path substituted for brush-model references that no longer exist.
pub const ERROR_MODEL: &str = "models/error.mdl";

// ============================================================
// Tokenizer
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub text: &'a str,
    /// Quoted tokens are never structural, even when they read "{".
    pub quoted: bool,
}

/// Whitespace-separated tokens with `//` comments and quoted strings.
pub struct Tokenizer<'a> {
    data: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(data: &'a str) -> Self {
        Self { data, pos: 0 }
    }

    fn skip_space_and_comments(&mut self) {
        let bytes = self.data.as_bytes();
        loop {
            while self.pos < bytes.len() && bytes[self.pos] <= b' ' {
                self.pos += 1;
            }
            if bytes[self.pos..].starts_with(b"//") {
                while self.pos < bytes.len() && bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        self.skip_space_and_comments();
        let bytes = self.data.as_bytes();
        if self.pos >= bytes.len() {
            return None;
        }

        if bytes[self.pos] == b'"' {
            let start = self.pos + 1;
            let end = bytes[start..]
                .iter()
                .position(|&b| b == b'"')
                .map_or(bytes.len(), |p| start + p);
            // unterminated quote runs to the end of the text
            self.pos = (end + 1).min(bytes.len());
            return Some(Token {
                text: &self.data[start..end],
                quoted: true,
            });
        }

        let start = self.pos;
        if bytes[start] == b'{' || bytes[start] == b'}' {
            self.pos += 1;
        } else {
            while self.pos < bytes.len()
                && bytes[self.pos] > b' '
                && !matches!(bytes[self.pos], b'{' | b'}' | b'"')
            {
                self.pos += 1;
            }
        }
        Some(Token {
            text: &self.data[start..self.pos],
            quoted: false,
        })
    }
}

// ============================================================
// Entities
// ============================================================

/// One entity: ordered key/value pairs. Duplicate keys are kept as found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entity {
    pub pairs: Vec<(String, String)>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classname(classname: &str) -> Self {
        let mut e = Self::new();
        e.set("classname", classname);
        e
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set the first pair with `key`, or append one.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.pairs.push((key.to_string(), value.to_string())),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.pairs.retain(|(k, _)| k != key);
    }

    pub fn classname(&self) -> &str {
        self.get("classname").unwrap_or("")
    }

    pub fn is_worldspawn(&self) -> bool {
        self.classname() == "worldspawn"
    }

    /// "x y z"; missing components read as 0, unparsable origins as `None`.
    pub fn origin(&self) -> Option<Vec3> {
        let text = self.get("origin")?;
        let mut out = [0.0f32; 3];
        for (slot, word) in out.iter_mut().zip(text.split_whitespace()) {
            *slot = word.parse().ok()?;
        }
        Some(out)
    }

    pub fn set_origin(&mut self, origin: Vec3) {
        let text = format!(
            "{} {} {}",
            format_coord(origin[0]),
            format_coord(origin[1]),
            format_coord(origin[2])
        );
        self.set("origin", &text);
    }

    /// Index `N` of a "model" "*N" reference.
    pub fn brush_model(&self) -> Option<usize> {
        self.get("model")?.strip_prefix('*')?.parse().ok()
    }

    pub fn set_brush_model(&mut self, index: usize) {
        self.set("model", &format!("*{index}"));
    }
}

/// Integral values print without a fractional part.
fn format_coord(v: f32) -> String {
    if v.fract() == 0.0 && v.abs() < 1e9 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Parse entity text. Malformed blocks are logged and skipped; parsing
/// never fails.
pub fn parse_entities(text: &str) -> Vec<Entity> {
    let mut tokens = Tokenizer::new(text);
    let mut out = Vec::new();

    while let Some(tok) = tokens.next() {
        if tok.quoted || tok.text != "{" {
            tracing::warn!(token = tok.text, "entity text: expected '{{'");
            continue;
        }

        let mut ent = Entity::new();
        loop {
            let Some(key) = tokens.next() else {
                tracing::warn!("entity text: EOF without closing brace");
                out.push(ent);
                return out;
            };
            if !key.quoted && key.text == "}" {
                break;
            }
            let Some(value) = tokens.next() else {
                tracing::warn!(key = key.text, "entity text: EOF inside key/value pair");
                out.push(ent);
                return out;
            };
            if !value.quoted && value.text == "}" {
                tracing::warn!(key = key.text, "entity text: closing brace without data");
                break;
            }
            ent.pairs.push((key.text.to_string(), value.text.to_string()));
        }
        out.push(ent);
    }
    out
}

/// Parse the raw entity lump, which may carry a trailing NUL.
pub fn parse_entity_lump(bytes: &[u8]) -> Vec<Entity> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    parse_entities(&String::from_utf8_lossy(&bytes[..end]))
}

/// Serialize to the lump form: blocks joined by a newline, no newline after
/// the last block, then a NUL terminator.
pub fn serialize_entities(entities: &[Entity]) -> Vec<u8> {
    let mut text = String::new();
    for (i, ent) in entities.iter().enumerate() {
        if i > 0 {
            text.push('\n');
        }
        text.push_str("{\n");
        for (k, v) in &ent.pairs {
            text.push('"');
            text.push_str(k);
            text.push_str("\" \"");
            text.push_str(v);
            text.push_str("\"\n");
        }
        text.push('}');
    }
    let mut bytes = text.into_bytes();
    bytes.push(0);
    bytes
}

/// Rewrite every "*N" reference through `map` (old index -> new index).
/// References mapped to `None` become `ERROR_MODEL`. Returns how many
/// references changed.
pub fn remap_brush_models(
    entities: &mut [Entity],
    mut map: impl FnMut(usize) -> Option<usize>,
) -> usize {
    let mut changed = 0;
    for ent in entities.iter_mut() {
        let Some(old) = ent.brush_model() else {
            continue;
        };
        match map(old) {
            Some(new) if new == old => {}
            Some(new) => {
                ent.set_brush_model(new);
                changed += 1;
            }
            None => {
                tracing::warn!(model = old, classname = ent.classname(), "dangling brush model reference");
                ent.set("model", ERROR_MODEL);
                changed += 1;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "{\n\"classname\" \"worldspawn\"\n\"wad\" \"halflife.wad\"\n}\n\
{\n\"classname\" \"func_door\"\n\"model\" \"*3\"\n\"origin\" \"16 -8 0\"\n}";

    #[test]
    fn tokenizer_splits_braces_quotes_and_comments() {
        let toks: Vec<_> = Tokenizer::new("// header\n{\"a b\" c}\"{\"")
            .map(|t| (t.text, t.quoted))
            .collect();
        assert_eq!(
            toks,
            vec![("{", false), ("a b", true), ("c", false), ("}", false), ("{", true)]
        );
    }

    #[test]
    fn parse_reads_pairs_in_order() {
        let ents = parse_entities(SAMPLE);
        assert_eq!(ents.len(), 2);
        assert!(ents[0].is_worldspawn());
        assert_eq!(ents[0].get("wad"), Some("halflife.wad"));
        assert_eq!(ents[1].brush_model(), Some(3));
        assert_eq!(ents[1].origin(), Some([16.0, -8.0, 0.0]));
    }

    #[test]
    fn serialize_has_no_trailing_newline_and_ends_in_nul() {
        let ents = parse_entities(SAMPLE);
        let bytes = serialize_entities(&ents);
        assert_eq!(bytes.last(), Some(&0));
        assert_eq!(&bytes[..bytes.len() - 1], SAMPLE.as_bytes());
        assert_eq!(parse_entity_lump(&bytes), ents);
    }

    #[test]
    fn quoted_brace_is_a_value() {
        let ents = parse_entities("{ \"message\" \"}\" }");
        assert_eq!(ents.len(), 1);
        assert_eq!(ents[0].get("message"), Some("}"));
    }

    #[test]
    fn truncated_text_keeps_what_was_read() {
        let ents = parse_entities("{ \"classname\" \"light\" \"style\"");
        assert_eq!(ents.len(), 1);
        assert_eq!(ents[0].classname(), "light");
    }

    #[test]
    fn origin_formatting() {
        let mut e = Entity::with_classname("info_player_start");
        e.set_origin([32.0, -0.5, 100.0]);
        assert_eq!(e.get("origin"), Some("32 -0.5 100"));
        e.set("origin", "1 x 2");
        assert_eq!(e.origin(), None);
    }

    #[test]
    fn brush_model_remap_and_error_sentinel() {
        let mut ents = parse_entities(SAMPLE);
        let mut other = Entity::with_classname("func_wall");
        other.set_brush_model(5);
        ents.push(other);

        let changed = remap_brush_models(&mut ents, |old| match old {
            3 => Some(2),
            _ => None,
        });
        assert_eq!(changed, 2);
        assert_eq!(ents[1].brush_model(), Some(2));
        assert_eq!(ents[2].get("model"), Some(ERROR_MODEL));
        assert_eq!(ents[0].brush_model(), None);
    }
}
