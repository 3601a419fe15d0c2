//! Work keys and their typed parses.
//!
//! The queue and dispatcher treat keys as opaque strings; only the
//! reconciler runtime interprets them. Two URL-shaped forms and one
//! path-reference form are recognized, everything else is rejected by the
//! parser (and passed through untouched by everything else).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unparseable key: {0}")]
/// The key did not match any recognized work key form.
pub struct ParseKeyError(pub String);

/// Identifies a repository, used to scope client caches and reconcile locks.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId {
    /// Repository owner (user or organization).
    pub owner: String,
    /// Repository name.
    pub repo: String,
}

impl RepoId {
    /// Construct from explicit owner and repository name.
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// A typed parse of a work key.
///
/// `Display` renders the canonical key form, so a `Resource` round-trips
/// through its own string representation.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    /// `https://github.com/{owner}/{repo}/pull/{number}`
    PullRequest {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Pull request number.
        number: u64,
    },
    /// `https://github.com/{owner}/{repo}/issues/{number}`
    Issue {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Issue number.
        number: u64,
    },
    /// `path:{owner}/{repo}/{ref}/{path}`
    Path {
        /// Repository owner.
        owner: String,
        /// Repository name.
        repo: String,
        /// Git ref the path is resolved against (branch, tag or sha).
        git_ref: String,
        /// Slash-separated path within the tree.
        path: String,
    },
}

const GITHUB_PREFIX: &str = "https://github.com/";
const PATH_PREFIX: &str = "path:";

impl Resource {
    /// The repository this resource belongs to.
    pub fn repo_id(&self) -> RepoId {
        match self {
            Resource::PullRequest { owner, repo, .. }
            | Resource::Issue { owner, repo, .. }
            | Resource::Path { owner, repo, .. } => RepoId::new(owner, repo),
        }
    }
}

impl FromStr for Resource {
    type Err = ParseKeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = key.strip_prefix(PATH_PREFIX) {
            return parse_path(key, rest);
        }
        if let Some(rest) = key.strip_prefix(GITHUB_PREFIX) {
            return parse_github_url(key, rest);
        }
        Err(ParseKeyError(key.into()))
    }
}

fn parse_github_url(key: &str, rest: &str) -> Result<Resource, ParseKeyError> {
    let segments = rest.split('/').collect::<Vec<_>>();
    let (owner, repo, kind, number) = match *segments.as_slice() {
        [owner, repo, kind, number] => (owner, repo, kind, number),
        _ => return Err(ParseKeyError(key.into())),
    };
    if owner.is_empty() || repo.is_empty() {
        return Err(ParseKeyError(key.into()));
    }
    let number = number.parse::<u64>().map_err(|_| ParseKeyError(key.into()))?;
    match kind {
        "pull" => Ok(Resource::PullRequest {
            owner: owner.into(),
            repo: repo.into(),
            number,
        }),
        "issues" => Ok(Resource::Issue {
            owner: owner.into(),
            repo: repo.into(),
            number,
        }),
        _ => Err(ParseKeyError(key.into())),
    }
}

fn parse_path(key: &str, rest: &str) -> Result<Resource, ParseKeyError> {
    // The path component may itself contain slashes, the ref may not.
    let segments = rest.splitn(4, '/').collect::<Vec<_>>();
    let (owner, repo, git_ref, path) = match *segments.as_slice() {
        [owner, repo, git_ref, path] => (owner, repo, git_ref, path),
        _ => return Err(ParseKeyError(key.into())),
    };
    if owner.is_empty() || repo.is_empty() || git_ref.is_empty() || path.is_empty() {
        return Err(ParseKeyError(key.into()));
    }
    Ok(Resource::Path {
        owner: owner.into(),
        repo: repo.into(),
        git_ref: git_ref.into(),
        path: path.into(),
    })
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::PullRequest { owner, repo, number } => {
                write!(f, "{GITHUB_PREFIX}{owner}/{repo}/pull/{number}")
            }
            Resource::Issue { owner, repo, number } => {
                write!(f, "{GITHUB_PREFIX}{owner}/{repo}/issues/{number}")
            }
            Resource::Path {
                owner,
                repo,
                git_ref,
                path,
            } => write!(f, "{PATH_PREFIX}{owner}/{repo}/{git_ref}/{path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ParseKeyError, RepoId, Resource};

    #[test]
    fn parses_pull_request_url() {
        let res = "https://github.com/octo/widgets/pull/42".parse::<Resource>().unwrap();
        assert_eq!(res, Resource::PullRequest {
            owner: "octo".into(),
            repo: "widgets".into(),
            number: 42,
        });
        assert_eq!(res.repo_id(), RepoId::new("octo", "widgets"));
    }

    #[test]
    fn parses_issue_url() {
        let res = "https://github.com/octo/widgets/issues/7".parse::<Resource>().unwrap();
        assert_eq!(res, Resource::Issue {
            owner: "octo".into(),
            repo: "widgets".into(),
            number: 7,
        });
    }

    #[test]
    fn parses_path_reference_with_nested_path() {
        let res = "path:octo/widgets/main/docs/adr/0001.md".parse::<Resource>().unwrap();
        assert_eq!(res, Resource::Path {
            owner: "octo".into(),
            repo: "widgets".into(),
            git_ref: "main".into(),
            path: "docs/adr/0001.md".into(),
        });
    }

    #[test]
    fn display_round_trips() {
        for key in [
            "https://github.com/octo/widgets/pull/42",
            "https://github.com/octo/widgets/issues/7",
            "path:octo/widgets/main/docs/adr/0001.md",
        ] {
            let res = key.parse::<Resource>().unwrap();
            assert_eq!(res.to_string(), key);
            assert_eq!(res.to_string().parse::<Resource>().unwrap(), res);
        }
    }

    #[test]
    fn rejects_malformed_keys() {
        for key in [
            "",
            "arbitrary-opaque-key",
            "http://github.com/octo/widgets/pull/42",
            "https://gitlab.com/octo/widgets/pull/42",
            "https://github.com/octo/widgets/pull/42/files",
            "https://github.com/octo/widgets/pull/",
            "https://github.com/octo/widgets/pull/abc",
            "https://github.com/octo/widgets/discussions/3",
            "https://github.com//widgets/pull/42",
            "path:octo/widgets/main",
            "path:octo/widgets//file.md",
            "path:octo/widgets/main/",
        ] {
            assert_eq!(
                key.parse::<Resource>(),
                Err(ParseKeyError(key.into())),
                "expected {key:?} to be rejected"
            );
        }
    }
}
