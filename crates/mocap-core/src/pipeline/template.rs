//! `{placeholder}` substitution for stage invocation templates.

use std::collections::HashMap;

/// Values available to a stage template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: HashMap<&'static str, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    /// Replace every `{key}` in `template`. Unknown keys and unclosed braces
    /// are errors, so a typo in a pipeline file fails the stage instead of
    /// reaching the tool as a literal.
    pub fn render(&self, template: &str) -> Result<String, String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| format!("unclosed '{{' in '{template}'"))?;
            let key = &after[..close];
            let value = self
                .values
                .get(key)
                .ok_or_else(|| format!("unknown placeholder '{{{key}}}' in '{template}'"))?;
            out.push_str(value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_placeholders() {
        let vars = TemplateVars::new()
            .set("work_dir", "/media/output/1")
            .set("stem", "walk");
        assert_eq!(
            vars.render("{work_dir}/v4_{stem}.bvh").unwrap(),
            "/media/output/1/v4_walk.bvh"
        );
        assert_eq!(vars.render("--headless").unwrap(), "--headless");
    }

    #[test]
    fn rejects_unknown_and_unclosed() {
        let vars = TemplateVars::new().set("input", "a.csv");
        assert!(vars.render("{inptu}").unwrap_err().contains("unknown placeholder"));
        assert!(vars.render("{input").unwrap_err().contains("unclosed"));
    }
}
