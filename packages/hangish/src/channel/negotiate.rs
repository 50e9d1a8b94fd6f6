//! Session negotiation: the `bind` POST and its reply.
//!
//! The reply is a list of numbered rows, e.g.
//!
//! ```text
//! [[0,["c","SID123","",8]]
//! ,[1,[{"gsid":"..."}]]
//! ,[2,["cfj","user@example.com/HEADERID"]]
//! ,[3,[["ei","GSESSION"]]]
//! ]
//! ```
//!
//! Rows are split at the top level first because some of them hold JSON
//! objects the array-literal parser does not accept; those rows are skipped.

use hangish_wire::{WireValue, parse_array_literal};
use tracing::debug;

use super::ChannelParams;
use crate::error::ChannelFailure;
use crate::http::HttpRequest;

pub const PROTOCOL_VERSION: &str = "8";
pub const NEGOTIATION_RID: &str = "81187";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub sid: String,
    pub gsession_id: Option<String>,
    /// Client id for RPC request headers, from the `cfj` row.
    pub client_id: Option<String>,
}

pub fn negotiation_request(origin: &str, params: &ChannelParams) -> HttpRequest {
    HttpRequest::post(format!("{origin}{}bind", params.path)).form([
        ("VER", PROTOCOL_VERSION),
        ("RID", NEGOTIATION_RID),
        ("clid", params.header_client_id.as_str()),
        ("prop", params.prop_param.as_str()),
        ("ec", params.ec_param.as_str()),
    ])
}

/// Map a non-success negotiation status onto a channel failure.
pub fn status_failure(status: u16) -> ChannelFailure {
    match status {
        401 => ChannelFailure::Unauthorized,
        other => ChannelFailure::Transport {
            status: Some(other),
            reason: "session negotiation rejected".into(),
        },
    }
}

pub fn parse_negotiation(body: &str) -> Result<NegotiatedSession, ChannelFailure> {
    let rows: Vec<WireValue> = split_rows(body)
        .into_iter()
        .filter_map(|row| match parse_array_literal(row) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "skipping negotiation row");
                None
            }
        })
        .collect();

    let sid = rows
        .iter()
        .find(|row| row.get(0).and_then(WireValue::as_i64) == Some(0))
        .and_then(|row| row.get(1))
        .filter(|inner| inner.get(0).and_then(WireValue::as_str) == Some("c"))
        .and_then(|inner| inner.get(1))
        .and_then(WireValue::as_str)
        .filter(|sid| !sid.is_empty())
        .ok_or_else(|| ChannelFailure::Transport {
            status: Some(200),
            reason: "no session id in negotiation reply".into(),
        })?
        .to_string();

    let client_id = rows
        .iter()
        .find_map(|row| find_tagged(row, "cfj"))
        .and_then(|v| v.rsplit_once('/').map(|(_, id)| id.to_string()));
    let gsession_id = rows
        .iter()
        .find_map(|row| find_tagged(row, "ei"))
        .map(str::to_string);

    Ok(NegotiatedSession {
        sid,
        gsession_id,
        client_id,
    })
}

/// First `["<tag>", "<value>"]` pair anywhere inside `value`.
fn find_tagged<'a>(value: &'a WireValue, tag: &str) -> Option<&'a str> {
    let items = value.as_array()?;
    if let [WireValue::String(t), WireValue::String(v), ..] = items {
        if t == tag {
            return Some(v);
        }
    }
    items.iter().find_map(|item| find_tagged(item, tag))
}

/// Slices of each top-level element of the outermost array.
fn split_rows(text: &str) -> Vec<&str> {
    let Some(open) = text.find('[') else {
        return Vec::new();
    };
    let bytes = text.as_bytes();
    let mut rows = Vec::new();
    let mut depth = 0usize;
    let mut row_start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open + 1) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => {
                if depth == 0 {
                    row_start = Some(i);
                }
                depth += 1;
            }
            b']' | b'}' => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = row_start.take() {
                        rows.push(&text[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = concat!(
        "163\n",
        "[[0,[\"c\",\"SID123\",\"\",8]\n]\n",
        ",[1,[{\"gsid\":\"x\",\"n\":[1,2]}]]\n",
        ",[2,[\"cfj\",\"someone@example.com/HCID9\"]]\n",
        ",[3,[[\"ei\",\"GS42\"]]]\n",
        "]\n"
    );

    #[test]
    fn parses_sid_client_id_and_gsession() {
        let session = parse_negotiation(REPLY).unwrap();
        assert_eq!(session.sid, "SID123");
        assert_eq!(session.client_id.as_deref(), Some("HCID9"));
        assert_eq!(session.gsession_id.as_deref(), Some("GS42"));
    }

    #[test]
    fn rows_with_objects_are_skipped() {
        let rows = split_rows(REPLY);
        assert_eq!(rows.len(), 4);
        assert!(parse_array_literal(rows[1]).is_err());
    }

    #[test]
    fn brackets_inside_strings_do_not_split() {
        let rows = split_rows(r#"[[0,["c","a]b",""]],[1,"[["]]"#);
        assert_eq!(rows, [r#"[0,["c","a]b",""]]"#, r#"[1,"[["]"#]);
    }

    #[test]
    fn missing_sid_is_a_transport_failure() {
        let err = parse_negotiation("[[1,[\"noop\"]]]").unwrap_err();
        assert!(matches!(err, ChannelFailure::Transport { status: Some(200), .. }));
        assert!(parse_negotiation("<html>").is_err());
    }

    #[test]
    fn optional_rows_may_be_absent() {
        let session = parse_negotiation(r#"[[0,["c","S",""]]]"#).unwrap();
        assert_eq!(session.gsession_id, None);
        assert_eq!(session.client_id, None);
    }

    #[test]
    fn request_carries_channel_parameters() {
        let params = ChannelParams {
            path: "/u/0/webchannel/".into(),
            ec_param: "[\"ci:ec\",true]".into(),
            prop_param: "hangish".into(),
            header_client_id: "HC".into(),
        };
        let req = negotiation_request("https://chat.example.test", &params);
        assert_eq!(req.url, "https://chat.example.test/u/0/webchannel/bind");
        let body = String::from_utf8(req.body.unwrap()).unwrap();
        assert!(body.starts_with("VER=8&RID=81187&clid=HC&prop=hangish&ec="));
    }

    #[test]
    fn statuses_map_to_failures() {
        assert_eq!(status_failure(401), ChannelFailure::Unauthorized);
        assert!(matches!(
            status_failure(400),
            ChannelFailure::Transport { status: Some(400), .. }
        ));
    }
}
