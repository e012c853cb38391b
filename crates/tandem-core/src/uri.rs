//! Out-of-band pairing URI.
//!
//! `tandem:<topic>@<version>?publicKey=..&symKey=..&controller=..&relay-protocol=..&ttl=..`

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::errors::UriError;
use crate::sequence::policy::SequenceKind;
use crate::sequence::types::{Participant, Proposal, RelayProtocolOptions, Signal};

pub const URI_SCHEME: &str = "tandem";
pub const URI_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUri {
    pub topic: String,
    pub version: u32,
    pub public_key: String,
    pub sym_key: String,
    pub controller: bool,
    pub relay: RelayProtocolOptions,
    pub ttl: u64,
}

impl PairingUri {
    /// Describe a pairing proposal as a URI.
    pub fn from_proposal(proposal: &Proposal) -> Self {
        Self {
            topic: proposal.topic.clone(),
            version: URI_VERSION,
            public_key: proposal.proposer.public_key.clone(),
            sym_key: proposal.sym_key.clone(),
            controller: proposal.proposer.controller,
            relay: proposal.relay.clone(),
            ttl: proposal.ttl,
        }
    }

    /// Rebuild the proposal on the responder side.
    pub fn into_proposal(self) -> Proposal {
        let uri = self.to_string();
        Proposal {
            topic: self.topic,
            sym_key: self.sym_key,
            relay: self.relay,
            proposer: Participant {
                public_key: self.public_key,
                controller: self.controller,
                metadata: None,
            },
            signal: Signal::Uri { uri },
            permissions: SequenceKind::Pairing.default_capabilities(),
            ttl: self.ttl,
        }
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("publicKey", &self.public_key)
            .append_pair("symKey", &self.sym_key)
            .append_pair("controller", if self.controller { "true" } else { "false" })
            .append_pair("relay-protocol", &self.relay.protocol)
            .append_pair("ttl", &self.ttl.to_string())
            .finish();
        write!(
            f,
            "{}:{}@{}?{}",
            URI_SCHEME, self.topic, self.version, query
        )
    }
}

impl FromStr for PairingUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s)?;
        if url.scheme() != URI_SCHEME {
            return Err(UriError::Scheme(url.scheme().to_string()));
        }

        let (topic, version) = url
            .path()
            .split_once('@')
            .ok_or(UriError::MissingField("version"))?;
        if topic.is_empty() {
            return Err(UriError::MissingField("topic"));
        }
        let version = version.parse().map_err(|_| UriError::InvalidField {
            field: "version",
            value: version.to_string(),
        })?;

        let mut public_key = None;
        let mut sym_key = None;
        let mut controller = None;
        let mut relay_protocol = None;
        let mut ttl = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "publicKey" => public_key = Some(value.into_owned()),
                "symKey" => sym_key = Some(value.into_owned()),
                "controller" => controller = Some(value.into_owned()),
                "relay-protocol" => relay_protocol = Some(value.into_owned()),
                "ttl" => ttl = Some(value.into_owned()),
                _ => {}
            }
        }

        let controller = match controller.as_deref() {
            Some("true") => true,
            Some("false") | None => false,
            Some(other) => {
                return Err(UriError::InvalidField {
                    field: "controller",
                    value: other.to_string(),
                })
            }
        };
        let ttl = match ttl {
            Some(ttl) => ttl.parse().map_err(|_| UriError::InvalidField {
                field: "ttl",
                value: ttl.clone(),
            })?,
            None => SequenceKind::Pairing.default_proposal_ttl(),
        };

        Ok(Self {
            topic: topic.to_string(),
            version,
            public_key: public_key
                .filter(|k| !k.is_empty())
                .ok_or(UriError::MissingField("publicKey"))?,
            sym_key: sym_key
                .filter(|k| !k.is_empty())
                .ok_or(UriError::MissingField("symKey"))?,
            controller,
            relay: RelayProtocolOptions {
                protocol: relay_protocol.unwrap_or_else(|| RelayProtocolOptions::default().protocol),
                params: None,
            },
            ttl,
        })
    }
}
