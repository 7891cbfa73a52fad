//! JSON line protocol spoken by the decoder main loop.
//!
//! Request: `{"q": "<tokens>", "sl": "en", "tl": "it", "hints": [...], "f": "<forced>"}`.
//! Response: `{"success": true, "data": [{"text": "...", "a": [[..], [..]]}]}`
//! or `{"success": false, "type": "...", "msg": "..."}`.

use serde::{Deserialize, Serialize};

use crate::error::DecoderError;
use crate::model::{Alignment, LanguageDirection, Sentence, Suggestion, Translation, Word};

/// Handshake line printed by a worker once its model is loaded.
pub const READY: &str = "READY";

#[derive(Debug, Serialize)]
struct Request<'a> {
    q: String,
    sl: &'a str,
    tl: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    hints: Vec<Hint<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    f: Option<String>,
}

#[derive(Debug, Serialize)]
struct Hint<'a> {
    sl: &'a str,
    tl: &'a str,
    seg: String,
    tra: String,
    scr: f32,
}

#[derive(Debug, Deserialize)]
struct Response {
    success: bool,
    #[serde(default)]
    data: Vec<ResponseEntry>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseEntry {
    text: String,
    #[serde(default)]
    a: Option<Vec<Vec<usize>>>,
}

/// Builds a translation request. `forced` switches the worker to
/// alignment-only mode against the given target tokens.
pub fn encode_request(
    direction: &LanguageDirection,
    sentence: &Sentence,
    suggestions: &[Suggestion],
    forced: Option<&[String]>,
) -> Result<String, DecoderError> {
    let request = Request {
        q: sentence.serialize(),
        sl: &direction.source,
        tl: &direction.target,
        hints: suggestions
            .iter()
            .map(|s| Hint {
                sl: &s.direction.source,
                tl: &s.direction.target,
                seg: s.source.join(" "),
                tra: s.translation.join(" "),
                scr: s.score,
            })
            .collect(),
        f: forced.map(|tokens| tokens.join(" ")),
    };

    let json = serde_json::to_string(&request)?;
    // one message per line
    Ok(json.replace('\n', " "))
}

/// Parses one response line.
///
/// Malformed payloads are reported as [`DecoderError::WorkerUnavailable`]
/// since the stream can no longer be trusted; a well-formed failure is a
/// [`DecoderError::Worker`].
pub fn decode_response(line: &str) -> Result<Vec<Translation>, DecoderError> {
    let response: Response = serde_json::from_str(line).map_err(|e| {
        DecoderError::WorkerUnavailable(format!("invalid response from decoder ({}): {}", e, line))
    })?;

    if !response.success {
        return Err(DecoderError::Worker {
            kind: response.kind.unwrap_or_else(|| "UnknownError".to_string()),
            message: response.msg,
        });
    }

    response
        .data
        .into_iter()
        .map(|entry| {
            let words = entry.text.split_whitespace().map(Word::new).collect();
            let alignment = entry.a.map(parse_alignment).transpose()?;
            Ok(Translation::new(words, alignment))
        })
        .collect()
}

fn parse_alignment(pairs: Vec<Vec<usize>>) -> Result<Alignment, DecoderError> {
    let mut iter = pairs.into_iter();
    match (iter.next(), iter.next()) {
        (None, _) => Ok(Alignment::default()),
        (Some(source), Some(target)) if source.len() == target.len() => {
            Ok(Alignment::new(source, target))
        }
        _ => Err(DecoderError::WorkerUnavailable(
            "malformed alignment in decoder response".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn en_it() -> LanguageDirection {
        LanguageDirection::new("en", "it")
    }

    #[test]
    fn test_encode_plain_request() {
        let line = encode_request(&en_it(), &Sentence::from_text("hello world"), &[], None).unwrap();
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(json["q"], "hello world");
        assert_eq!(json["sl"], "en");
        assert_eq!(json["tl"], "it");
        assert!(json.get("hints").is_none());
        assert!(json.get("f").is_none());
    }

    #[test]
    fn test_encode_hints_and_forced() {
        let hints = vec![Suggestion::new(en_it(), "hello there", "ciao a te", 0.75)];
        let forced = vec!["ciao".to_string(), "mondo".to_string()];
        let line = encode_request(
            &en_it(),
            &Sentence::from_text("hello world"),
            &hints,
            Some(&forced),
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(json["hints"][0]["seg"], "hello there");
        assert_eq!(json["hints"][0]["tra"], "ciao a te");
        assert_eq!(json["hints"][0]["scr"], 0.75);
        assert_eq!(json["f"], "ciao mondo");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_decode_success_with_alignment() {
        let line = r#"{"success":true,"data":[{"text":"ciao mondo","a":[[0,1],[0,1]]}]}"#;
        let translations = decode_response(line).unwrap();

        assert_eq!(translations.len(), 1);
        assert_eq!(translations[0].tokens(), vec!["ciao", "mondo"]);
        let alignment = translations[0].alignment.as_ref().unwrap();
        assert_eq!(alignment.source, vec![0, 1]);
        assert_eq!(alignment.target, vec![0, 1]);
    }

    #[test]
    fn test_decode_empty_alignment() {
        let line = r#"{"success":true,"data":[{"text":"ciao","a":[]}]}"#;
        let translations = decode_response(line).unwrap();
        assert!(translations[0].alignment.as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_decode_structured_failure() {
        let line = r#"{"success":false,"type":"InputTooLong","msg":"512 tokens max"}"#;
        match decode_response(line) {
            Err(DecoderError::Worker { kind, message }) => {
                assert_eq!(kind, "InputTooLong");
                assert_eq!(message.as_deref(), Some("512 tokens max"));
            }
            other => panic!("Expected Worker error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_is_unavailable() {
        let err = decode_response("Traceback (most recent call last):").unwrap_err();
        assert!(err.is_unavailable());

        let err = decode_response(r#"{"success":true,"data":[{"text":"x","a":[[0]]}]}"#)
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
