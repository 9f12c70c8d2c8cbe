//! Shell command chains run inside a container.

use std::fmt;

/// A command with setup, follow-up and always-run parts.
///
/// Rendered as `pres && cmd && posts ; finals`. Each element of `pres`,
/// `posts` and `finals` is one already-formed shell command; empty ones are
/// dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellCommand {
    pub pres: Vec<String>,
    pub cmd: String,
    pub posts: Vec<String>,
    pub finals: Vec<String>,
}

impl ShellCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Default::default()
        }
    }

    pub fn with_pre(mut self, pre: impl Into<String>) -> Self {
        self.pres.push(pre.into());
        self
    }

    pub fn with_post(mut self, post: impl Into<String>) -> Self {
        self.posts.push(post.into());
        self
    }

    pub fn with_final(mut self, last: impl Into<String>) -> Self {
        self.finals.push(last.into());
        self
    }

    /// Append arguments to the main command.
    pub fn push_args(&mut self, args: &str) {
        let args = args.trim();
        if args.is_empty() {
            return;
        }
        if !self.cmd.is_empty() {
            self.cmd.push(' ');
        }
        self.cmd.push_str(args);
    }

    pub fn is_empty(&self) -> bool {
        self.cmd.trim().is_empty()
    }

    pub fn build(&self) -> String {
        let non_empty = |s: &&String| !s.trim().is_empty();

        let chain: Vec<&str> = self
            .pres
            .iter()
            .filter(non_empty)
            .chain(std::iter::once(&self.cmd).filter(non_empty))
            .chain(self.posts.iter().filter(non_empty))
            .map(String::as_str)
            .collect();

        let mut parts = vec![chain.join(" && ")];
        parts.extend(self.finals.iter().filter(non_empty).cloned());
        parts.retain(|p| !p.is_empty());
        parts.join(" ; ")
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

/// Header written at the top of a container log before launch.
pub fn transcript(run_cmd: &str) -> String {
    format!(
        "Docker command:\n{}\n=================================================\n",
        run_cmd.replace("&& ", "&&\n").replace("|| ", "||\n\t")
    )
}
