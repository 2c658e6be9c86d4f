//! Two-pass SQL template substitution.
//!
//! Layer SQL is authored against a zoom/tile-independent `!token!`
//! vocabulary (pass 1). The resolved layer SQL is then embedded into the
//! fixed wrapping query through `{name}` placeholders (pass 2). The passes
//! use disjoint delimiters and substituted values are never rescanned, so
//! the two vocabularies cannot collide and a value containing either
//! delimiter passes through untouched.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::SubstitutionError;

/// Fixed values for the legacy tiling-protocol tokens. Layers written for
/// the wider protocol keep working; the values are constants because this
/// renderer scopes queries through the envelope filter instead.
static LEGACY_TOKENS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("zoom", "0"),
        ("var_zoom", "0"),
        (
            "var_bbox",
            "[-20037508.34,-20037508.34,20037508.34,20037508.34]",
        ),
        ("var_x", "0"),
        ("var_y", "0"),
    ])
});

/// Tile-specific values resolved into a layer template during pass 1.
#[derive(Clone, Debug)]
pub struct TokenValues {
    /// Replacement for `!bbox!`: an envelope constructor over the buffered
    /// tile extent.
    pub bbox: String,
    /// Replacement for `!scale_denominator!`, per the standard 0.28mm
    /// nominal pixel size.
    pub scale_denominator: String,
    /// Replacement for `!pixel_width!` and `!pixel_height!`.
    pub pixel_size: String,
}

impl TokenValues {
    fn resolve(&self, token: &str) -> Option<&str> {
        match token {
            "bbox" => Some(&self.bbox),
            "scale_denominator" => Some(&self.scale_denominator),
            "pixel_width" | "pixel_height" => Some(&self.pixel_size),
            other => LEGACY_TOKENS.get(other).copied(),
        }
    }
}

/// Pass 1: resolves `!token!` occurrences in a layer SQL template.
///
/// Unrecognized tokens (and stray `!` characters, e.g. `!=`) are left
/// verbatim, which also makes the pass idempotent: re-applying it to its
/// own output changes nothing.
pub fn replace_tokens(template: &str, values: &TokenValues) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('!') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let token_end = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if after[token_end..].starts_with('!') {
            if let Some(value) = values.resolve(&after[..token_end]) {
                output.push_str(value);
                rest = &after[token_end + 1..];
                continue;
            }
        }
        // not a recognized token, keep the '!' and move on
        output.push('!');
        rest = after;
    }
    output.push_str(rest);
    output
}

/// Pass 2: substitutes `{name}` placeholders from a value map.
///
/// Every well-formed placeholder must have a value; a missing one is an
/// error rather than an empty substitution. Braces that do not delimit an
/// identifier are emitted as-is.
pub fn format_named(
    template: &str,
    values: &HashMap<String, String>,
) -> Result<String, SubstitutionError> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let name_end = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if name_end > 0 && after[name_end..].starts_with('}') {
            let name = &after[..name_end];
            match values.get(name) {
                Some(value) => output.push_str(value),
                None => return Err(SubstitutionError::MissingPlaceholder(name.to_string())),
            }
            rest = &after[name_end + 1..];
        } else {
            output.push('{');
            rest = after;
        }
    }
    output.push_str(rest);
    Ok(output)
}
