//! Path handling. A file is addressed as `/dir/name:passphrase`; the
//! passphrase is split on the last `:` of the final component and may be
//! empty. Directory paths are absolute, `/`-separated, with no trailing
//! slash except the root itself.

use crate::param::PASSWORD_SEPARATOR;

/// Split `/dir/name:pass` into `(dir, name, pass)`.
///
/// The directory of a top-level file is `"/"`; a missing passphrase yields
/// the empty string, which participates in key derivation as itself.
pub fn split(path: &str) -> (&str, &str, &str) {
    let cut = path.rfind('/').unwrap_or(0);
    let dir = if cut == 0 { &path[..1.min(path.len())] } else { &path[..cut] };
    let rest = if path.len() > cut { &path[cut + 1..] } else { "" };
    match rest.rfind(PASSWORD_SEPARATOR) {
        Some(c) => (dir, &rest[..c], &rest[c + 1..]),
        None => (dir, rest, ""),
    }
}

/// Strip a `:passphrase` suffix, leaving the plain `/dir/name` path.
pub fn without_password(path: &str) -> &str {
    let (dir, name, _) = split(path);
    let keep = if dir.len() == 1 { 1 + name.len() } else { dir.len() + 1 + name.len() };
    &path[..keep]
}

/// Join a directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Component names of a directory path, shallowest first.
pub fn components(dir: &str) -> impl Iterator<Item = &str> {
    dir.split('/').filter(|c| !c.is_empty())
}

/// Every ancestor directory of `dir` from shallowest down to `dir` itself,
/// excluding the root: `/a/b` yields `/a`, `/a/b`.
pub fn ancestors(dir: &str) -> Vec<&str> {
    let mut out = Vec::new();
    if dir == "/" || dir.is_empty() {
        return out;
    }
    let bytes = dir.as_bytes();
    for i in 1..bytes.len() {
        if bytes[i] == b'/' {
            out.push(&dir[..i]);
        }
    }
    out.push(dir);
    out
}
