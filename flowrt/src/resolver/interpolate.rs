//! `{{ expr }}` placeholders inside string values.
//!
//! Unlike direct variable resolution this is fail-open: an expression that names
//! nothing leaves its placeholder in the text, so tool command templates keep their
//! `{{arg}}` slots for later substitution.

use super::path::get_nested_value;
use super::Resolver;
use flowlang::Value;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder pattern compiles"));

const KNOWN_BASES: [&str; 4] = ["params", "step", "env", "date"];

impl Resolver<'_> {
    pub fn interpolate(&self, text: &str) -> String {
        self.interpolate_keeping(text, |_| false)
    }

    /// Like `interpolate`, but placeholders whose trimmed expression satisfies `keep`
    /// are left untouched.
    pub fn interpolate_keeping(&self, text: &str, keep: impl Fn(&str) -> bool) -> String {
        if !text.contains("{{") {
            return text.to_string();
        }
        PLACEHOLDER
            .replace_all(text, |caps: &Captures| {
                let expr = caps[1].trim();
                if keep(expr) {
                    return caps[0].to_string();
                }
                match self.eval_expression(expr) {
                    Some(value) => value.to_display_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// `$name`, a dotted path, or a bare variable name.
    pub(crate) fn eval_expression(&self, expr: &str) -> Option<Value> {
        if expr.is_empty() {
            return None;
        }
        if let Some(rest) = expr.strip_prefix('$') {
            let (name, path) = split_path(rest);
            let value = self.ctx.get_var(name)?;
            return get_nested_value(&value, &path).ok();
        }
        if expr.contains('.') {
            let (base, path) = split_path(expr);
            if KNOWN_BASES.contains(&base) {
                return self.property_access(base, &path).ok();
            }
            let value = self.ctx.get_var(base)?;
            return get_nested_value(&value, &path).ok();
        }
        self.ctx.get_var(expr)
    }
}

fn split_path(expr: &str) -> (&str, Vec<String>) {
    let mut segments = expr.split('.');
    let base = segments.next().unwrap_or_default();
    (base, segments.map(str::to_string).collect())
}
