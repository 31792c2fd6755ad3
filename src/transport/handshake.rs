//! Connection-establishment metadata carried in the upgrade request's query
//! string, e.g. `ws://host:3000/?offset=42&session=<uuid>`.

use crate::client::SessionId;
use crate::persistence::SequenceId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    /// Highest sequence id the client has seen; `0` when absent or unparseable.
    pub last_known_offset: SequenceId,
    /// Session the client wants to resume.
    pub session_id: Option<SessionId>,
}

impl ConnectParams {
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = ConnectParams::default();
        let Some(query) = query else {
            return params;
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "offset" | "serverOffset" => {
                    params.last_known_offset = value.trim().parse().unwrap_or(0);
                }
                "session" if !value.trim().is_empty() => {
                    params.session_id = Some(value.trim().to_string());
                }
                _ => {}
            }
        }
        params
    }

    /// Query string a client should connect with.
    pub fn to_query(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("offset", &self.last_known_offset.to_string());
        if let Some(session) = &self.session_id {
            query.append_pair("session", session);
        }
        query.finish()
    }
}
