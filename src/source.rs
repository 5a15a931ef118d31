use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Immutable description of one translation unit's compile.
///
/// Two `Source`s with equal fingerprints (`key()`) describe interchangeable
/// compiles: same file, same effective arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub source_file: PathBuf,
    pub compiler: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    /// Id in the coordinator's file table; 0 until assigned.
    pub file_id: u32,
}

impl Source {
    /// 64-bit fingerprint over path + normalized arguments.
    ///
    /// Output-file arguments and the source path itself are dropped from the
    /// argument vector so `cc -c a.c -o a.o` and `cc -c a.c -o b.o`
    /// fingerprint equal. Stable across processes and architectures.
    pub fn key(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.source_file.as_os_str().as_encoded_bytes());
        hasher.update([0u8]);
        for arg in self.normalized_arguments() {
            hasher.update(arg.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        u64::from_le_bytes(digest[..8].try_into().unwrap())
    }

    fn normalized_arguments(&self) -> impl Iterator<Item = &String> {
        let mut skip_next = false;
        self.arguments.iter().filter(move |arg| {
            if skip_next {
                skip_next = false;
                return false;
            }
            if arg.as_str() == "-o" {
                skip_next = true;
                return false;
            }
            if self.names_source_file(arg) {
                return false;
            }
            true
        })
    }

    /// The argument is this source file, absolute or relative.
    pub(crate) fn names_source_file(&self, arg: &str) -> bool {
        Path::new(arg) == self.source_file
            || (is_source_file(arg) && self.source_file.ends_with(arg))
    }

    /// Parse a raw compile command line into a `Source`.
    ///
    /// Recognizes `-c`-style compiles of a single C/C++ source file. Link
    /// lines, multi-file invocations, and preprocessor-only runs yield
    /// `None`; the caller drops those.
    pub fn parse(command_line: &str, working_directory: &Path) -> Option<Source> {
        let mut parts = command_line.split_whitespace();
        let compiler = PathBuf::from(parts.next()?);

        let mut arguments = Vec::new();
        let mut source_file: Option<PathBuf> = None;
        let mut compile = false;
        let mut skip_next = false;
        for arg in parts {
            if skip_next {
                skip_next = false;
                arguments.push(arg.to_string());
                continue;
            }
            match arg {
                "-c" => compile = true,
                "-o" | "-MF" | "-MT" | "-MQ" => skip_next = true,
                "-E" | "-M" | "-MM" => return None,
                _ if is_source_file(arg) => {
                    if source_file.is_some() {
                        // multi-file invocations are not indexable units
                        return None;
                    }
                    let path = working_directory.join(arg);
                    source_file = Some(normalize(&path));
                }
                _ => {}
            }
            if arg != "-c" {
                arguments.push(arg.to_string());
            }
        }

        if !compile {
            return None;
        }
        Some(Source {
            source_file: source_file?,
            compiler,
            arguments,
            working_directory: working_directory.to_path_buf(),
            file_id: 0,
        })
    }
}

pub(crate) fn is_source_file(arg: &str) -> bool {
    const EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "C", "m", "mm"];
    !arg.starts_with('-')
        && Path::new(arg)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| EXTENSIONS.contains(&e))
            .unwrap_or(false)
}

/// Lexically normalize `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_recognizes_simple_compile() {
        let source = Source::parse("gcc -c -I/usr/include foo.c -o foo.o", Path::new("/src"))
            .expect("compile command");
        assert_eq!(source.source_file, PathBuf::from("/src/foo.c"));
        assert_eq!(source.compiler, PathBuf::from("gcc"));
        assert!(source.arguments.contains(&"-I/usr/include".to_string()));
    }

    #[test]
    fn parse_rejects_link_lines() {
        assert!(Source::parse("gcc foo.o bar.o -o app", Path::new("/src")).is_none());
        assert!(Source::parse("gcc -E foo.c", Path::new("/src")).is_none());
    }

    #[test]
    fn key_ignores_output_path() {
        let a = Source::parse("cc -c x.c -o x.o", Path::new("/p")).unwrap();
        let b = Source::parse("cc -c x.c -o other.o", Path::new("/p")).unwrap();
        assert_eq!(a.key(), b.key());

        let c = Source::parse("cc -c -DFOO x.c -o x.o", Path::new("/p")).unwrap();
        assert_ne!(a.key(), c.key());
    }
}
