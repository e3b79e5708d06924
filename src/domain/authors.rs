use serde::Deserialize;

/// Maps known blogs (and gist/github handles) to display authors, for
/// producers whose entries carry no usable author of their own.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorRule {
    /// Substring matched against a feed's site link.
    #[serde(default)]
    pub url_pattern: Option<String>,
    /// Substring matched against a submitted post's URL (gists, raw github
    /// links).
    #[serde(default)]
    pub github_pattern: Option<String>,
    pub author: String,
}

/// Author for a feed whose own metadata carried none.
pub fn author_for_site(rules: &[AuthorRule], site_url: &str) -> Option<String> {
    rules
        .iter()
        .find(|rule| {
            rule.url_pattern
                .as_deref()
                .is_some_and(|pattern| site_url.contains(pattern))
        })
        .map(|rule| rule.author.clone())
}

/// Author for a submitted link that matches a known github handle.
pub fn author_for_submission(rules: &[AuthorRule], post_url: &str) -> Option<String> {
    rules
        .iter()
        .find(|rule| {
            rule.github_pattern
                .as_deref()
                .is_some_and(|pattern| post_url.contains(pattern))
        })
        .map(|rule| rule.author.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<AuthorRule> {
        vec![
            AuthorRule {
                url_pattern: Some("paul.kinlan.me".to_string()),
                github_pattern: None,
                author: "Paul Kinlan".to_string(),
            },
            AuthorRule {
                url_pattern: None,
                github_pattern: Some("gist.github.com/ebidel".to_string()),
                author: "Eric Bidelman".to_string(),
            },
        ]
    }

    #[test]
    fn site_lookup_matches_substring() {
        let rules = rules();
        assert_eq!(
            author_for_site(&rules, "https://paul.kinlan.me/"),
            Some("Paul Kinlan".to_string())
        );
        assert_eq!(author_for_site(&rules, "https://unknown.dev/"), None);
    }

    #[test]
    fn submission_lookup_uses_github_patterns() {
        let rules = rules();
        assert_eq!(
            author_for_submission(&rules, "https://gist.github.com/ebidel/abc123"),
            Some("Eric Bidelman".to_string())
        );
        assert_eq!(
            author_for_submission(&rules, "https://paul.kinlan.me/post"),
            None
        );
    }
}
