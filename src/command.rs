//! Structured container-run command lines.
//!
//! A [`CommandSpec`] is an argument vector, not a shell string. It is spawned
//! directly; the flat single-line form only exists for logs and error
//! messages, and every such rendering goes through [`quote`].

use std::fmt;

/// How a flat rendering quotes arguments for the host's shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStyle {
    /// `sh`/`bash`: single quotes, `'` written as `'\''`.
    Posix,
    /// PowerShell: double quotes, backtick escapes.
    PowerShell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Secret(String),
}

/// One argument, possibly containing a secret segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    parts: Vec<Part>,
}

impl Arg {
    pub fn text(s: impl Into<String>) -> Self {
        Self { parts: vec![Part::Text(s.into())] }
    }

    pub fn secret(s: impl Into<String>) -> Self {
        Self { parts: vec![Part::Secret(s.into())] }
    }

    pub fn then_text(mut self, s: impl Into<String>) -> Self {
        self.parts.push(Part::Text(s.into()));
        self
    }

    pub fn then_secret(mut self, s: impl Into<String>) -> Self {
        self.parts.push(Part::Secret(s.into()));
        self
    }

    /// The real argument as handed to the process.
    pub fn value(&self) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                Part::Text(s) | Part::Secret(s) => s.as_str(),
            })
            .collect()
    }

    pub fn redacted(&self) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                Part::Text(s) => s.as_str(),
                Part::Secret(_) => "***",
            })
            .collect()
    }

    fn secrets(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Secret(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        })
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::text(s)
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::text(s)
    }
}

/// A fully assembled command for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<Arg>,
    style: QuoteStyle,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, style: QuoteStyle) -> Self {
        Self { program: program.into(), args: Vec::new(), style }
    }

    pub fn arg(&mut self, arg: impl Into<Arg>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `flag value` as two arguments.
    pub fn flag(&mut self, flag: &str, value: impl Into<Arg>) -> &mut Self {
        self.arg(flag).arg(value)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Real argument values, program excluded.
    pub fn argv(&self) -> Vec<String> {
        self.args.iter().map(Arg::value).collect()
    }

    /// Redacted argument values, program excluded.
    pub fn redacted_argv(&self) -> Vec<String> {
        self.args.iter().map(Arg::redacted).collect()
    }

    /// Single-line form with real values. Not for logging.
    pub fn render(&self) -> String {
        self.join(self.argv())
    }

    /// Single-line form with every secret segment replaced by `***`.
    pub fn redacted(&self) -> String {
        self.join(self.redacted_argv())
    }

    /// Replaces every secret value carried by this command inside `text`.
    ///
    /// Each line of a multi-line secret is masked on its own as well, so
    /// output seen one line at a time never shows a fragment.
    pub fn mask(&self, text: &str) -> String {
        let mut secrets: Vec<&str> = Vec::new();
        for secret in self.args.iter().flat_map(Arg::secrets) {
            secrets.push(secret);
            if secret.contains('\n') {
                secrets.extend(secret.lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.is_empty()));
            }
        }
        // longest first so a secret that contains another is masked whole
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets
            .into_iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret, "***"))
    }

    fn join(&self, argv: Vec<String>) -> String {
        std::iter::once(quote(&self.program, self.style))
            .chain(argv.iter().map(|a| quote(a, self.style)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

fn is_bare(s: &str, style: QuoteStyle) -> bool {
    // `,` builds an array and a leading `@` splats in PowerShell
    let safe = |c: char| match style {
        QuoteStyle::Posix => matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ','),
        QuoteStyle::PowerShell => matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '%' | '+'),
    };
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || safe(c))
}

/// Quotes one argument for the given shell. Words made only of safe
/// characters are left bare.
pub fn quote(arg: &str, style: QuoteStyle) -> String {
    if is_bare(arg, style) {
        return arg.to_string();
    }
    match style {
        QuoteStyle::Posix => format!("'{}'", arg.replace('\'', r"'\''")),
        QuoteStyle::PowerShell => {
            let mut out = String::with_capacity(arg.len() + 2);
            out.push('"');
            for c in arg.chars() {
                if matches!(c, '`' | '"' | '$') {
                    out.push('`');
                }
                out.push(c);
            }
            out.push('"');
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_words_stay_unquoted() {
        assert_eq!(quote("--volume", QuoteStyle::Posix), "--volume");
        assert_eq!(quote("/a/b:/c:z", QuoteStyle::Posix), "/a/b:/c:z");
        assert_eq!(quote("GITHUB_WORKSPACE=/ws", QuoteStyle::PowerShell), "GITHUB_WORKSPACE=/ws");
    }

    #[test]
    fn posix_quoting() {
        assert_eq!(quote("a b", QuoteStyle::Posix), "'a b'");
        assert_eq!(quote("", QuoteStyle::Posix), "''");
        assert_eq!(quote("it's", QuoteStyle::Posix), r"'it'\''s'");
        assert_eq!(quote("$(rm -rf /)", QuoteStyle::Posix), "'$(rm -rf /)'");
    }

    #[test]
    fn powershell_quoting() {
        assert_eq!(
            quote("C:/Program Files (x86)/Windows Kits", QuoteStyle::PowerShell),
            "\"C:/Program Files (x86)/Windows Kits\""
        );
        assert_eq!(quote("a\"$b", QuoteStyle::PowerShell), "\"a`\"`$b\"");
        assert_eq!(quote("VERSION=1,2", QuoteStyle::PowerShell), "\"VERSION=1,2\"");
        assert_eq!(quote("@args", QuoteStyle::PowerShell), "\"@args\"");
    }

    #[test]
    fn posix_keeps_commas_and_at_signs_bare() {
        assert_eq!(quote("VERSION=1,2", QuoteStyle::Posix), "VERSION=1,2");
        assert_eq!(quote("/actions/a@v2", QuoteStyle::Posix), "/actions/a@v2");
    }

    #[test]
    fn redaction_hides_secret_segments() {
        let mut spec = CommandSpec::new("docker", QuoteStyle::Posix);
        spec.flag("--env", Arg::text("GIT_PRIVATE_TOKEN=").then_secret("ghp_abc"))
            .flag("--volume", Arg::secret("/tmp/ssh-agent.sock").then_text(":/ssh-agent"));

        let line = spec.redacted();
        assert!(!line.contains("ghp_abc"));
        assert!(!line.contains("ssh-agent.sock"));
        assert_eq!(line, "docker --env 'GIT_PRIVATE_TOKEN=***' --volume '***:/ssh-agent'");
        assert_eq!(spec.to_string(), line);
        assert_eq!(spec.argv()[1], "GIT_PRIVATE_TOKEN=ghp_abc");
    }

    #[test]
    fn mask_replaces_secrets_in_output() {
        let mut spec = CommandSpec::new("docker", QuoteStyle::Posix);
        spec.arg(Arg::secret("abc")).arg(Arg::secret("abcdef")).arg(Arg::secret(""));
        assert_eq!(spec.mask("token abcdef and abc here"), "token *** and *** here");
    }

    #[test]
    fn multi_line_secrets_are_masked_whole_and_per_line() {
        let mut spec = CommandSpec::new("docker", QuoteStyle::Posix);
        spec.arg(Arg::secret("line1\nline2"));
        assert_eq!(spec.mask("leak line1\nline2 end"), "leak *** end");
        assert_eq!(spec.mask("leak line1"), "leak ***");
        assert_eq!(spec.mask("line2 end"), "*** end");
    }
}
