//! Batch updates inside a push frame.
//!
//! A frame is a list of submissions, `[[id, payload], ...]`. Payloads are
//! either `["noop"]` keep-alives or
//! `["c", [channel_id, ["bfo", data]]]`, where `data` is `["cbu", ...]`
//! (sometimes wrapped in one more array, sometimes sent as a string holding
//! the array literal).

use hangish_wire::{DecodeError, StructuredMessage, WireValue, decode_tagged, parse_array_literal};
use tracing::trace;

use crate::schemas::BATCH_UPDATE;

/// Decode every batch update carried by `frame`.
pub fn batch_updates(frame: &WireValue) -> Result<Vec<StructuredMessage>, DecodeError> {
    let submissions = frame
        .as_array()
        .ok_or_else(|| DecodeError::Shape {
            field: "submissions",
            expected: "an array",
        })?;

    let mut updates = Vec::new();
    for submission in submissions {
        let Some(payload) = submission.get(1) else {
            continue;
        };
        if payload.get(0).and_then(WireValue::as_str) == Some("noop") {
            trace!("noop submission");
            continue;
        }
        let Some(data) = bfo_data(payload) else {
            continue;
        };
        match data {
            WireValue::String(text) => collect_cbu(&parse_array_literal(text)?, &mut updates)?,
            other => collect_cbu(other, &mut updates)?,
        }
    }
    Ok(updates)
}

fn bfo_data(payload: &WireValue) -> Option<&WireValue> {
    if payload.get(0)?.as_str()? != "c" {
        return None;
    }
    let inner = payload.get(1)?.get(1)?;
    if inner.get(0)?.as_str()? != "bfo" {
        return None;
    }
    inner.get(1)
}

fn collect_cbu(data: &WireValue, out: &mut Vec<StructuredMessage>) -> Result<(), DecodeError> {
    match data.get(0) {
        Some(WireValue::String(tag)) if tag == "cbu" => {
            out.push(decode_tagged(data, "cbu", &BATCH_UPDATE)?);
        }
        Some(WireValue::Array(_)) => {
            for item in data.as_array().unwrap_or_default() {
                if item.get(0).and_then(WireValue::as_str) == Some("cbu") {
                    out.push(decode_tagged(item, "cbu", &BATCH_UPDATE)?);
                }
            }
        }
        _ => {}
    }
    Ok(())
}
