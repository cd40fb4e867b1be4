use std::ffi::OsString;
use std::path::PathBuf;

use crate::domain::Submission;

/// Locations of the JDK binaries. The defaults resolve through PATH inside
/// the sandbox; point them at absolute paths to pin a specific JDK.
#[derive(Clone, Debug)]
pub struct JavaToolchain {
    pub javac: PathBuf,
    pub java: PathBuf,
}

impl Default for JavaToolchain {
    fn default() -> Self {
        JavaToolchain {
            javac: PathBuf::from("javac"),
            java: PathBuf::from("java"),
        }
    }
}

impl JavaToolchain {
    pub fn new(javac: impl Into<PathBuf>, java: impl Into<PathBuf>) -> Self {
        JavaToolchain {
            javac: javac.into(),
            java: java.into(),
        }
    }

    /// `javac -encoding utf8 -d . <sources...>`, run from the scope directory.
    /// Only `.java` files are handed to the compiler; other materialized
    /// files are resources the program may read at run time.
    pub(crate) fn compile_command(&self, submission: &Submission) -> (PathBuf, Vec<OsString>) {
        let mut args: Vec<OsString> = ["-encoding", "utf8", "-d", "."]
            .into_iter()
            .map(OsString::from)
            .collect();
        for file in &submission.files {
            if file.name.ends_with(".java") {
                args.push(OsString::from(&file.name));
            }
        }
        (self.javac.clone(), args)
    }

    /// `java -cp . <entry>`, run from the scope directory. No `-Xmx` is
    /// passed; the governor owns the memory ceiling.
    pub(crate) fn run_command(&self, entry_point: &str) -> (PathBuf, Vec<OsString>) {
        let args = vec![
            OsString::from("-cp"),
            OsString::from("."),
            OsString::from(entry_point),
        ];
        (self.java.clone(), args)
    }
}

/// First `public class <identifier>` in the source, if any. Matches the
/// token-adjacent form only: `public final class X` is not picked up, which
/// is why callers fall back to `Main`.
pub fn public_class_name(source: &str) -> Option<String> {
    let tokens: Vec<&str> = source.split_whitespace().collect();
    for window in tokens.windows(3) {
        if window[0] == "public" && window[1] == "class" {
            let name: String = window[2]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}
