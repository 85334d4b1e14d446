use tracing::debug;

/// Password list collector for archive extraction
///
/// Collects passwords from multiple sources in priority order:
/// 1. Cached correct password (from an earlier run, keyed by archive MD5)
/// 2. Empty password (optional)
/// 3. Password file (one password per line)
///
/// The empty password goes before the file so an unencrypted archive never
/// reports a file password as the one that worked.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PasswordList {
    passwords: Vec<String>,
}

impl PasswordList {
    /// Collect passwords from all sources, de-duplicated, in priority order
    ///
    /// An unreadable password file is logged and ignored.
    pub async fn collect(
        cached_correct: Option<&str>,
        password_file: Option<&std::path::Path>,
        try_empty: bool,
    ) -> Self {
        let mut list = Self::default();

        if let Some(pw) = cached_correct {
            list.push(pw);
        }

        if try_empty {
            list.push("");
        }

        if let Some(path) = password_file {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    for line in content.lines() {
                        let pw = line.trim();
                        if !pw.is_empty() {
                            list.push(pw);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read password file");
                }
            }
        }

        debug!(
            "collected {} unique passwords for extraction",
            list.passwords.len()
        );

        list
    }

    /// Build a list from explicit passwords, keeping order and dropping duplicates
    pub fn from_passwords<I, S>(passwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for pw in passwords {
            list.push(pw.as_ref());
        }
        list
    }

    fn push(&mut self, password: &str) {
        if !self.passwords.iter().any(|p| p == password) {
            self.passwords.push(password.to_string());
        }
    }

    /// Get an iterator over passwords
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.passwords.iter()
    }

    /// Check if there are any passwords to try
    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }

    /// Get the number of passwords
    pub fn len(&self) -> usize {
        self.passwords.len()
    }
}
