//! `{{ name }}` placeholder substitution for config strings

use std::collections::BTreeMap;

use crate::config::ConfigError;

/// Variables available to templates
pub type TemplateVars = BTreeMap<String, String>;

/// Replace every `{{ name }}` in `template` with its value from `vars`
///
/// Whitespace inside the braces is ignored. Unknown names and unclosed
/// placeholders are errors rather than being left in the output.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| ConfigError::UnclosedPlaceholder(template.to_owned()))?;

        let name = after[..end].trim();
        let value = vars.get(name).ok_or_else(|| ConfigError::UnknownVariable {
            name: name.to_owned(),
            template: template.to_owned(),
        })?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}
