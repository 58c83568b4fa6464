use thiserror::Error;

/// Failure of a fetch against a site API. A fetch that fails is never
/// reported as an empty resource list; the reconciler must be able to tell
/// "nothing exists" apart from "the API did not answer".
#[derive(Debug, Error)]
pub enum FetchError {
    /// Bad or expired credentials. Fatal for this site's cycle, retried on
    /// the next one.
    #[error("authentication failed for site {site}: {reason}")]
    Auth { site: String, reason: String },

    /// Network trouble or a transient API error (timeout, 5xx). The unit is
    /// skipped this cycle with no state mutation.
    #[error("transient fetch failure for site {site}: {reason}")]
    Transient { site: String, reason: String },

    /// The API answered but the payload did not normalize into the canonical
    /// record shape. Surfaced instead of silently dropping fields.
    #[error("malformed payload from site {site}: {reason}")]
    Malformed { site: String, reason: String },
}

impl FetchError {
    pub fn site(&self) -> &str {
        match self {
            FetchError::Auth { site, .. }
            | FetchError::Transient { site, .. }
            | FetchError::Malformed { site, .. } => site,
        }
    }
}

/// Failure of a single delete call. Reported per resource; never aborts a
/// cleanup batch and never marks `user_deleted`.
#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("provider rejected delete of {resource_id}: {reason}")]
    Rejected { resource_id: String, reason: String },

    #[error("authentication failed deleting {resource_id}: {reason}")]
    Auth { resource_id: String, reason: String },

    #[error("transient failure deleting {resource_id}: {reason}")]
    Transient { resource_id: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_names_the_site() {
        let err = FetchError::Auth {
            site: "chi@uc".into(),
            reason: "401 Unauthorized".into(),
        };
        assert!(err.to_string().contains("chi@uc"));
        assert_eq!(err.site(), "chi@uc");
    }

    #[test]
    fn delete_error_names_the_resource() {
        let err = DeleteError::Rejected {
            resource_id: "abc-123".into(),
            reason: "409 Conflict".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc-123"), "got: {msg}");
        assert!(msg.contains("409"), "got: {msg}");
    }
}
