/// Values substituted into configuration strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    pub project: String,
    pub version: String,
    pub package: String,
    pub arch: String,
    pub triple: String,
}

impl TemplateContext {
    fn lookup(&self, placeholder: &str) -> Option<&str> {
        match placeholder {
            "project" => Some(&self.project),
            "version" => Some(&self.version),
            "package" => Some(&self.package),
            "arch" => Some(&self.arch),
            "triple" => Some(&self.triple),
            _ => None,
        }
    }

    /// Replace `{project}`, `{version}`, `{package}`, `{arch}` and `{triple}`.
    ///
    /// Substituted values are not rescanned, and unknown `{...}` sequences
    /// are left alone, so `{a,b}` glob alternations survive templating.
    pub fn apply(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];

            let replaced = tail.find('}').and_then(|close| {
                self.lookup(&tail[1..close])
                    .map(|value| (value, close + 1))
            });

            match replaced {
                Some((value, consumed)) => {
                    out.push_str(value);
                    rest = &tail[consumed..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }

        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            project: "caddy".into(),
            version: "2.7.6".into(),
            package: "caddy".into(),
            arch: "arm64".into(),
            triple: "aarch64-unknown-freebsd".into(),
        }
    }

    #[test]
    fn test_all_placeholders() {
        assert_eq!(
            ctx().apply("https://x/{project}/v{version}/{package}_{arch}_{triple}.tgz"),
            "https://x/caddy/v2.7.6/caddy_arm64_aarch64-unknown-freebsd.tgz"
        );
    }

    #[test]
    fn test_unknown_braces_survive() {
        assert_eq!(ctx().apply("bin/{a,b}/{arch}"), "bin/{a,b}/arm64");
        assert_eq!(ctx().apply("trailing {"), "trailing {");
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let mut c = ctx();
        c.version = "{arch}".into();
        assert_eq!(c.apply("{version}"), "{arch}");
    }
}
