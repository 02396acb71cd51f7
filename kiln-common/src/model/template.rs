// kiln-common/src/model/template.rs
// Placeholder expansion for step arguments, e.g. `-o={bin}/{name}`.
//
// `{{` and `}}` produce literal braces. `${...}` is passed through untouched so
// shell scripts can keep using their own variables.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{KilnError, Result};

/// Directories below the install prefix that have their own placeholder.
pub const PREFIX_SUBDIRS: &[&str] = &["bin", "sbin", "lib", "include", "share", "libexec", "etc"];

/// Expands to the standard `go build` argument set. Only valid as a whole argument.
pub const STD_GO_ARGS: &str = "{std_go_args}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Name,
    Version,
    Prefix,
    PrefixSubdir(&'static str),
    Buildpath,
    Flag(String),
    Opt(String),
    StdGoArgs,
}

impl Placeholder {
    fn parse(token: &str) -> std::result::Result<Self, String> {
        if let Some(flag) = token.strip_prefix("flag:") {
            return if flag.is_empty() {
                Err("empty flag name in '{flag:}'".to_string())
            } else {
                Ok(Placeholder::Flag(flag.to_string()))
            };
        }
        if let Some(dep) = token.strip_prefix("opt:") {
            return if dep.is_empty() {
                Err("empty dependency name in '{opt:}'".to_string())
            } else {
                Ok(Placeholder::Opt(dep.to_string()))
            };
        }
        match token {
            "name" => Ok(Placeholder::Name),
            "version" => Ok(Placeholder::Version),
            "prefix" => Ok(Placeholder::Prefix),
            "buildpath" => Ok(Placeholder::Buildpath),
            "std_go_args" => Ok(Placeholder::StdGoArgs),
            other => PREFIX_SUBDIRS
                .iter()
                .find(|d| **d == other)
                .map(|d| Placeholder::PrefixSubdir(*d))
                .ok_or_else(|| format!("unknown placeholder '{{{other}}}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(Placeholder),
}

fn segments(input: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut out = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '$' if chars.peek() == Some(&'{') => {
                // Shell parameter expansion, copied verbatim up to the closing brace.
                literal.push('$');
                for inner in chars.by_ref() {
                    literal.push(inner);
                    if inner == '}' {
                        break;
                    }
                }
            }
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut token = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    token.push(inner);
                }
                if !closed {
                    return Err(format!("unterminated placeholder in '{input}'"));
                }
                if !literal.is_empty() {
                    out.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                out.push(Segment::Var(Placeholder::parse(token.trim())?));
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        out.push(Segment::Literal(literal));
    }
    Ok(out)
}

/// Lists every placeholder referenced by `input`, or describes why it cannot be parsed.
pub fn placeholders(input: &str) -> std::result::Result<Vec<Placeholder>, String> {
    Ok(segments(input)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Var(p) => Some(p),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Values substituted into step arguments.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub prefix: &'a Path,
    pub buildpath: Option<&'a Path>,
    pub flags: &'a BTreeMap<String, String>,
    pub opt_paths: &'a HashMap<String, PathBuf>,
}

impl TemplateContext<'_> {
    fn error(&self, reason: impl Into<String>) -> KilnError {
        KilnError::malformed(self.name, reason)
    }

    fn value_of(&self, placeholder: &Placeholder) -> Result<String> {
        let value = match placeholder {
            Placeholder::Name => self.name.to_string(),
            Placeholder::Version => self.version.to_string(),
            Placeholder::Prefix => self.prefix.to_string_lossy().into_owned(),
            Placeholder::PrefixSubdir(dir) => self.prefix.join(dir).to_string_lossy().into_owned(),
            Placeholder::Buildpath => self
                .buildpath
                .ok_or_else(|| self.error("{buildpath} is only available during the build"))?
                .to_string_lossy()
                .into_owned(),
            Placeholder::Flag(flag) => self
                .flags
                .get(flag)
                .cloned()
                .ok_or_else(|| self.error(format!("flag '{flag}' is not declared")))?,
            Placeholder::Opt(dep) => self
                .opt_paths
                .get(dep)
                .ok_or_else(|| self.error(format!("dependency '{dep}' is not resolved")))?
                .to_string_lossy()
                .into_owned(),
            Placeholder::StdGoArgs => {
                return Err(self.error("{std_go_args} must be a whole argument"));
            }
        };
        Ok(value)
    }

    /// Expands a single string.
    pub fn expand(&self, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        for segment in segments(input).map_err(|e| self.error(e))? {
            match segment {
                Segment::Literal(text) => out.push_str(&text),
                Segment::Var(placeholder) => out.push_str(&self.value_of(&placeholder)?),
            }
        }
        Ok(out)
    }

    /// Expands an argument list. A whole `{std_go_args}` argument becomes
    /// `-trimpath -o={bin}/{name}` plus `-ldflags={flag:ldflags}` when that
    /// flag is declared.
    pub fn expand_args(&self, args: &[String]) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            if arg.trim() == STD_GO_ARGS {
                out.extend(self.std_go_args());
            } else {
                out.push(self.expand(arg)?);
            }
        }
        Ok(out)
    }

    fn std_go_args(&self) -> Vec<String> {
        let output = self.prefix.join("bin").join(self.name);
        let mut args = vec![
            "-trimpath".to_string(),
            format!("-o={}", output.to_string_lossy()),
        ];
        if let Some(ldflags) = self.flags.get("ldflags") {
            args.push(format!("-ldflags={ldflags}"));
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(
        flags: &'a BTreeMap<String, String>,
        opt: &'a HashMap<String, PathBuf>,
    ) -> TemplateContext<'a> {
        TemplateContext {
            name: "guise",
            version: "0.1.0",
            prefix: Path::new("/k/Cellar/guise/0.1.0"),
            buildpath: Some(Path::new("/k/tmp/build")),
            flags,
            opt_paths: opt,
        }
    }

    #[test]
    fn expands_builtins_flags_and_deps() {
        let flags = BTreeMap::from([("ldflags".to_string(), "-s -w".to_string())]);
        let opt = HashMap::from([("go".to_string(), PathBuf::from("/k/prefix/opt/go"))]);
        let ctx = context(&flags, &opt);

        assert_eq!(
            ctx.expand("{bin}/{name}-{version}").unwrap(),
            "/k/Cellar/guise/0.1.0/bin/guise-0.1.0"
        );
        assert_eq!(ctx.expand("{flag:ldflags}").unwrap(), "-s -w");
        assert_eq!(ctx.expand("{opt:go}/bin/go").unwrap(), "/k/prefix/opt/go/bin/go");
        assert_eq!(ctx.expand("cd {buildpath}").unwrap(), "cd /k/tmp/build");
    }

    #[test]
    fn shell_variables_and_escaped_braces_pass_through() {
        let flags = BTreeMap::new();
        let opt = HashMap::new();
        let ctx = context(&flags, &opt);
        assert_eq!(
            ctx.expand("echo ${HOME} {{literal}} {name}").unwrap(),
            "echo ${HOME} {literal} guise"
        );
    }

    #[test]
    fn std_go_args_expands_to_several_arguments() {
        let flags = BTreeMap::from([("ldflags".to_string(), "-s -w".to_string())]);
        let opt = HashMap::new();
        let ctx = context(&flags, &opt);
        let args = ctx
            .expand_args(&["build".to_string(), "{std_go_args}".to_string()])
            .unwrap();
        assert_eq!(
            args,
            vec![
                "build",
                "-trimpath",
                "-o=/k/Cellar/guise/0.1.0/bin/guise",
                "-ldflags=-s -w"
            ]
        );
    }

    #[test]
    fn rejects_unknown_and_unterminated_placeholders() {
        assert!(placeholders("{nope}").is_err());
        assert!(placeholders("{bin").is_err());
        assert_eq!(
            placeholders("{flag:x}/{opt:go}").unwrap(),
            vec![
                Placeholder::Flag("x".to_string()),
                Placeholder::Opt("go".to_string())
            ]
        );
    }

    #[test]
    fn undeclared_flag_is_an_error() {
        let flags = BTreeMap::new();
        let opt = HashMap::new();
        let ctx = context(&flags, &opt);
        assert!(matches!(
            ctx.expand("{flag:ldflags}"),
            Err(KilnError::MalformedFormula { .. })
        ));
    }
}
