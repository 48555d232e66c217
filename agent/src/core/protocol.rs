//! Textual function-call protocol.
//!
//! The model must end every response with exactly one call block:
//!
//! ```text
//! reasoning...
//! ----BEGIN_FUNCTION_CALL----
//! function_name
//! ----ARG----
//! arg_name
//! ----VALUE----
//! arg value (may span lines)
//! ----END_FUNCTION_CALL----
//! ```
//!
//! Only the last begin/end pair counts, so marker-like text inside the
//! reasoning is ignored.

use std::collections::BTreeMap;

use crate::core::error::ProtocolError;
use crate::core::types::ParsedCall;

pub const BEGIN_CALL: &str = "----BEGIN_FUNCTION_CALL----";
pub const END_CALL: &str = "----END_FUNCTION_CALL----";
pub const ARG_SEP: &str = "----ARG----";
pub const VALUE_SEP: &str = "----VALUE----";

/// The four delimiters of a call block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub begin: String,
    pub end: String,
    pub arg_sep: String,
    pub value_sep: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            begin: BEGIN_CALL.to_string(),
            end: END_CALL.to_string(),
            arg_sep: ARG_SEP.to_string(),
            value_sep: VALUE_SEP.to_string(),
        }
    }
}

/// Encoder/decoder for call blocks using a fixed set of markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCodec {
    markers: Markers,
}

impl CallCodec {
    pub fn new(markers: Markers) -> Self {
        Self { markers }
    }

    /// Stop marker for the model transport.
    pub fn stop_marker(&self) -> &str {
        &self.markers.end
    }

    /// Response format the system prompt shows the model.
    pub fn format_template(&self) -> String {
        let Markers {
            begin,
            end,
            arg_sep,
            value_sep,
        } = &self.markers;
        format!(
            "your_thoughts_here\n...\n{begin}\nfunction_name\n{arg_sep}\narg1_name\n{value_sep}\narg1_value (can be multiline)\n{arg_sep}\narg2_name\n{value_sep}\narg2_value (can be multiline)\n...\n{end}"
        )
    }

    /// Render a call in the exact format `decode` accepts.
    pub fn encode(&self, call: &ParsedCall) -> String {
        let mut buf = String::new();
        let thought = call.thought.trim();
        if !thought.is_empty() {
            buf.push_str(thought);
            buf.push('\n');
        }
        buf.push_str(&self.markers.begin);
        buf.push('\n');
        buf.push_str(&call.name);
        buf.push('\n');
        for (name, value) in &call.arguments {
            buf.push_str(&self.markers.arg_sep);
            buf.push('\n');
            buf.push_str(name);
            buf.push('\n');
            buf.push_str(&self.markers.value_sep);
            buf.push('\n');
            buf.push_str(value);
            buf.push('\n');
        }
        buf.push_str(&self.markers.end);
        buf
    }

    /// Extract the final call block from `text`.
    ///
    /// Duplicate argument names keep the last value.
    pub fn decode(&self, text: &str) -> Result<ParsedCall, ProtocolError> {
        let begin = text
            .rfind(&self.markers.begin)
            .ok_or_else(|| ProtocolError::MissingBegin {
                marker: self.markers.begin.clone(),
            })?;
        let end = text
            .rfind(&self.markers.end)
            .ok_or_else(|| ProtocolError::MissingEnd {
                marker: self.markers.end.clone(),
            })?;
        let block_start = begin + self.markers.begin.len();
        if end < block_start {
            return Err(ProtocolError::EndBeforeBegin);
        }

        let thought = text[..begin].trim().to_string();
        let block = text[block_start..end].trim();
        if block.is_empty() {
            return Err(ProtocolError::EmptyBlock);
        }

        let mut segments = block.split(self.markers.arg_sep.as_str());
        let name = segments.next().unwrap_or_default().trim().to_string();
        if name.is_empty() {
            return Err(ProtocolError::EmptyName);
        }

        let mut arguments = BTreeMap::new();
        for (index, segment) in segments.enumerate() {
            let (arg_name, value) = segment
                .split_once(self.markers.value_sep.as_str())
                .ok_or_else(|| ProtocolError::MissingValueSeparator {
                    index,
                    marker: self.markers.value_sep.clone(),
                })?;
            let arg_name = arg_name.trim();
            if arg_name.is_empty() {
                return Err(ProtocolError::EmptyArgumentName { index });
            }
            arguments.insert(arg_name.to_string(), value.trim().to_string());
        }

        Ok(ParsedCall {
            thought,
            name,
            arguments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[(&str, &str)]) -> ParsedCall {
        ParsedCall {
            thought: "I should look around.".to_string(),
            name: name.to_string(),
            arguments: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn decodes_encoded_call() {
        let codec = CallCodec::default();
        let original = call(
            "replace_in_file",
            &[
                ("file_path", "src/lib.rs"),
                ("old_text", "fn a() {\n    1\n}"),
                ("new_text", "fn a() {\n    2\n}"),
            ],
        );

        let decoded = codec.decode(&codec.encode(&original)).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn encoding_trims_thought_like_decoding() {
        let codec = CallCodec::default();
        let mut padded = call("finish", &[("result", "done")]);
        padded.thought = "\n  Looks fixed.  \n".to_string();

        let encoded = codec.encode(&padded);
        assert!(encoded.starts_with(&format!("Looks fixed.\n{BEGIN_CALL}")));
        let decoded = codec.decode(&encoded).expect("decode");
        assert_eq!(decoded.thought, "Looks fixed.");
        assert_eq!(codec.encode(&decoded), encoded);

        padded.thought = "   ".to_string();
        assert!(codec.encode(&padded).starts_with(BEGIN_CALL));
    }

    #[test]
    fn decodes_call_without_arguments() {
        let codec = CallCodec::default();
        let text = format!("thinking\n{BEGIN_CALL}\nfinish\n{END_CALL}");
        let decoded = codec.decode(&text).expect("decode");
        assert_eq!(decoded.name, "finish");
        assert!(decoded.arguments.is_empty());
        assert_eq!(decoded.thought, "thinking");
    }

    #[test]
    fn ignores_decoy_markers_before_last_block() {
        let codec = CallCodec::default();
        let text = "...----END_FUNCTION_CALL---- noise ----BEGIN_FUNCTION_CALL----\nrun_bash_cmd\n----ARG----\ncmd\n----VALUE----\nls\n----END_FUNCTION_CALL----";

        let decoded = codec.decode(text).expect("decode");
        assert_eq!(decoded.name, "run_bash_cmd");
        assert_eq!(decoded.arguments.len(), 1);
        assert_eq!(decoded.arguments["cmd"], "ls");
    }

    #[test]
    fn uses_last_of_multiple_blocks() {
        let codec = CallCodec::default();
        let first = codec.encode(&call("show_file", &[("file_path", "a.py")]));
        let second = codec.encode(&call("run_bash_cmd", &[("command", "pytest")]));
        let decoded = codec
            .decode(&format!("{first}\nwait, actually\n{second}"))
            .expect("decode");
        assert_eq!(decoded.name, "run_bash_cmd");
        assert_eq!(decoded.arguments["command"], "pytest");
    }

    #[test]
    fn rejects_missing_end_marker() {
        let codec = CallCodec::default();
        let err = codec
            .decode(&format!("{BEGIN_CALL}\nfinish\n"))
            .expect_err("missing end");
        assert!(matches!(err, ProtocolError::MissingEnd { .. }));
    }

    #[test]
    fn rejects_missing_begin_marker() {
        let codec = CallCodec::default();
        let err = codec
            .decode(&format!("finish\n{END_CALL}"))
            .expect_err("missing begin");
        assert!(matches!(err, ProtocolError::MissingBegin { .. }));
    }

    #[test]
    fn rejects_begin_after_end() {
        let codec = CallCodec::default();
        let err = codec
            .decode(&format!("{END_CALL}\nfinish\n{BEGIN_CALL}"))
            .expect_err("reversed");
        assert_eq!(err, ProtocolError::EndBeforeBegin);
    }

    #[test]
    fn rejects_empty_block_and_empty_name() {
        let codec = CallCodec::default();
        let err = codec
            .decode(&format!("{BEGIN_CALL}\n  \n{END_CALL}"))
            .expect_err("empty");
        assert_eq!(err, ProtocolError::EmptyBlock);

        let err = codec
            .decode(&format!("{BEGIN_CALL}\n{ARG_SEP}\nx\n{VALUE_SEP}\ny\n{END_CALL}"))
            .expect_err("empty name");
        assert_eq!(err, ProtocolError::EmptyName);
    }

    #[test]
    fn rejects_argument_without_value_separator() {
        let codec = CallCodec::default();
        let text = format!("{BEGIN_CALL}\nrun_bash_cmd\n{ARG_SEP}\ncommand ls\n{END_CALL}");
        let err = codec.decode(&text).expect_err("no value sep");
        assert!(matches!(
            err,
            ProtocolError::MissingValueSeparator { index: 0, .. }
        ));
    }

    #[test]
    fn keeps_inner_newlines_of_values() {
        let codec = CallCodec::default();
        let text = format!(
            "{BEGIN_CALL}\nrun_bash_cmd\n{ARG_SEP}\ncommand\n{VALUE_SEP}\n\n  cd src\n\n  ls\n\n{END_CALL}"
        );
        let decoded = codec.decode(&text).expect("decode");
        assert_eq!(decoded.arguments["command"], "cd src\n\n  ls");
    }

    #[test]
    fn custom_markers_are_honored() {
        let codec = CallCodec::new(Markers {
            begin: "<<CALL>>".to_string(),
            end: "<<END>>".to_string(),
            arg_sep: "<<ARG>>".to_string(),
            value_sep: "<<VAL>>".to_string(),
        });
        let decoded = codec
            .decode("hmm\n<<CALL>>\nfinish\n<<ARG>>\nresult\n<<VAL>>\ndone\n<<END>>")
            .expect("decode");
        assert_eq!(decoded.name, "finish");
        assert_eq!(decoded.arguments["result"], "done");
        assert_eq!(codec.stop_marker(), "<<END>>");
        assert!(codec.format_template().contains("<<VAL>>"));
    }

    #[test]
    fn bare_begin_marker_is_rejected() {
        let codec = CallCodec::default();
        assert!(codec.decode(BEGIN_CALL).is_err());
        assert!(codec.format_template().starts_with("your_thoughts_here"));
    }
}
