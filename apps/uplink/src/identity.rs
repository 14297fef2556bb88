//! Role resolution from the page's launch parameters.
//!
//! The role-specific identity structs can only be built here. Anything that
//! needs to know "this process is the client" (or the remote) takes one of
//! them by reference, which keeps the authoritative state out of reach of a
//! remote session:
//!
//! ```compile_fail
//! let forged = uplink_session::identity::ClientIdentity { _sealed: () };
//! ```

use std::fmt;

use peer_transport::PeerId;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Remote,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Remote => f.write_str("remote"),
        }
    }
}

/// Proof that this process hosts the scene and owns session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    _sealed: (),
}

/// Proof that this process is a controller dialing `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentity {
    target: PeerId,
}

impl RemoteIdentity {
    pub fn target(&self) -> &PeerId {
        &self.target
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Client(ClientIdentity),
    Remote(RemoteIdentity),
}

impl Identity {
    pub fn role(&self) -> Role {
        match self {
            Identity::Client(_) => Role::Client,
            Identity::Remote(_) => Role::Remote,
        }
    }

    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Identity::Client(_) => None,
            Identity::Remote(remote) => Some(remote.target()),
        }
    }
}

/// Query parameters the page was launched with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchParameters {
    pub id: Option<String>,
    pub controls: Option<String>,
}

impl LaunchParameters {
    /// Parses `id=...&controls=...`, with or without a leading `?`.
    /// The first occurrence of a repeated key wins.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "id" if params.id.is_none() => params.id = Some(value.into_owned()),
                "controls" if params.controls.is_none() => {
                    params.controls = Some(value.into_owned())
                }
                _ => {}
            }
        }
        params
    }

    /// Reads the query of a full page URL. Anything unparseable yields no parameters.
    pub fn from_url(url: &str) -> Self {
        match Url::parse(url) {
            Ok(url) => url.query().map(Self::from_query).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Accepts a full URL or a bare query string.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.contains("://") {
            Self::from_url(input)
        } else {
            Self::from_query(input)
        }
    }

    /// Whether the debug overlay starts visible. `None` when not specified.
    pub fn show_controls(&self) -> Option<bool> {
        self.controls.as_deref().map(|raw| {
            !matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "" | "0" | "false" | "no" | "off"
            )
        })
    }
}

pub struct IdentityResolver;

impl IdentityResolver {
    /// A non-blank `id` makes this process a remote dialing that id;
    /// everything else falls back to the client role.
    pub fn resolve(params: &LaunchParameters) -> Identity {
        match params.id.as_deref().map(str::trim) {
            Some(target) if !target.is_empty() => Identity::Remote(RemoteIdentity {
                target: PeerId::new(target),
            }),
            _ => Identity::Client(ClientIdentity { _sealed: () }),
        }
    }
}

/// The link a client advertises (as a QR code) so a phone can join it.
pub fn join_link(base: &Url, peer: &PeerId) -> Url {
    let mut link = base.clone();
    link.set_fragment(None);
    link.query_pairs_mut().clear().append_pair("id", peer.as_str());
    link
}
