//! Human-readable workspace IDs.

/// Maximum length of a derived ID.
pub const MAX_ID_LEN: usize = 48;

/// Derive a workspace ID from a source string.
///
/// The last path segment of the repository or folder is used, with scheme,
/// `.git` suffix and trailing slashes removed. For `repo@ref` sources a ref
/// containing `/` (`feat/x`, `pr/12`) names the workspace; a plain branch
/// falls back to the whole repository path.
pub fn to_id(source: &str) -> String {
    let mut rest = source.trim();
    if let Some(pos) = rest.find("://") {
        rest = &rest[pos + 3..];
    }
    let rest = rest.strip_prefix("git@").unwrap_or(rest);

    if let Some((repo, reference)) = rest.rsplit_once('@') {
        if !reference.is_empty() && !repo.is_empty() {
            if reference.contains('/') {
                return sanitize(&reference.replace('/', "-"));
            }
            let repo = strip_repo_suffix(repo);
            return sanitize(&repo.replace(['/', '.', ':'], "-"));
        }
    }

    let repo = strip_repo_suffix(rest);
    let last = repo.rsplit(['/', ':']).next().unwrap_or(repo);
    sanitize(last)
}

fn strip_repo_suffix(repo: &str) -> &str {
    let repo = repo.trim_end_matches('/');
    repo.strip_suffix(".git").unwrap_or(repo)
}

/// Lowercase, keep `[a-z0-9-]`, collapse repeated hyphens, truncate.
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            '-' if !out.is_empty() && !out.ends_with('-') => out.push('-'),
            _ => {}
        }
    }
    out.truncate(MAX_ID_LEN);
    out.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_id() {
        let cases = [
            ("github.com/kled-io/kled", "kled"),
            ("github.com/kled-io/kled.git", "kled"),
            ("https://github.com/kled-io/kled.git", "kled"),
            ("github.com/kled-io/kled/", "kled"),
            ("git@github.com:kled-io/kled.git", "kled"),
            ("myrepo", "myrepo"),
            ("/home/dev/Projects/My_App", "myapp"),
            ("github.com/kled-io/kled@feature1", "github-com-kled-io-kled"),
            ("github.com/kled-io/kled@feat/feature1", "feat-feature1"),
            ("github.com/kled-io/kled@pr/123", "pr-123"),
            (
                "github.com/kled-io/kledreallylongreponame_that_exceeds_48_characters_total_length",
                "kledreallylongreponamethatexceeds48characterstot",
            ),
        ];
        for (input, want) in cases {
            assert_eq!(to_id(input), want, "to_id({:?})", input);
        }
    }

    #[test]
    fn test_id_never_exceeds_limit() {
        let id = to_id(&"a".repeat(200));
        assert_eq!(id.len(), MAX_ID_LEN);
    }
}
