use sha2::{Digest, Sha256};

pub(crate) fn hash<S: AsRef<[u8]>>(data: S) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Returns the short hex fingerprint identifying a repository URL.
pub fn fingerprint(url: &str) -> String {
    hash(url)[..8].to_string()
}

/// Joins path segments with `/`, dropping empty segments.
pub(crate) fn join_path<'a, I: IntoIterator<Item = &'a str>>(segments: I) -> String {
    segments
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
