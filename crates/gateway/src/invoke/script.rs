//! Combined invocation scripts for batched contract calls.
//!
//! Batch order is script order; the chain executes the calls strictly
//! sequentially within one transaction context. The orchestrator treats the
//! output as an opaque buffer, so all that matters here is that the framing
//! is deterministic and unambiguous: every variable-length item is encoded as
//! a length-of-length byte (1, 2 or 4), the length in little-endian, then the
//! payload.

use crate::chain::ScriptHash;

use super::{InvocationRequest, InvokeArg};

/// Opcode introducing a contract call frame.
const OP_APP_CALL: u8 = 0x67;

const TAG_BYTES: u8 = 0x00;
const TAG_INTEGER: u8 = 0x01;
const TAG_LIST: u8 = 0x02;

pub(crate) struct ScriptBuilder {
    buf: Vec<u8>,
}

impl ScriptBuilder {
    pub(crate) fn new() -> Self {
        ScriptBuilder { buf: Vec::new() }
    }

    pub(crate) fn emit_app_call(
        &mut self,
        contract: &ScriptHash,
        method: &str,
        args: &[InvokeArg],
    ) {
        self.buf.push(OP_APP_CALL);
        self.buf.extend_from_slice(contract.as_bytes());
        self.emit_var_bytes(method.as_bytes());
        self.emit_args(args);
    }

    fn emit_args(&mut self, args: &[InvokeArg]) {
        self.emit_length(args.len());
        for arg in args {
            self.emit_arg(arg);
        }
    }

    fn emit_arg(&mut self, arg: &InvokeArg) {
        match arg {
            InvokeArg::String(s) => {
                self.buf.push(TAG_BYTES);
                self.emit_var_bytes(s.as_bytes());
            }
            InvokeArg::Bytes(bytes) => {
                self.buf.push(TAG_BYTES);
                self.emit_var_bytes(bytes);
            }
            InvokeArg::Integer(value) => {
                self.buf.push(TAG_INTEGER);
                self.buf.extend_from_slice(&value.to_le_bytes());
            }
            InvokeArg::List(items) => {
                self.buf.push(TAG_LIST);
                self.emit_args(items);
            }
        }
    }

    fn emit_var_bytes(&mut self, data: &[u8]) {
        self.emit_length(data.len());
        self.buf.extend_from_slice(data);
    }

    fn emit_length(&mut self, len: usize) {
        if len <= u8::MAX as usize {
            self.buf.push(1);
            self.buf.push(len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.push(2);
            self.buf.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.buf.push(4);
            self.buf.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Compiles a batch of requests into one script, preserving batch order.
pub(crate) fn build_batch_script(
    contract: &ScriptHash,
    requests: &[InvocationRequest],
) -> Vec<u8> {
    let mut builder = ScriptBuilder::new();
    for request in requests {
        builder.emit_app_call(contract, &request.method, &request.args);
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> ScriptHash {
        "d63a0b437a16579288361ccb593570e5c5f71149".parse().unwrap()
    }

    #[test]
    fn encoding_is_deterministic() {
        let requests = vec![
            InvocationRequest::new("getRecord", vec![InvokeArg::String("ABC".into())]),
            InvocationRequest::new("getRecordCount", vec![]),
        ];
        let a = build_batch_script(&contract(), &requests);
        let b = build_batch_script(&contract(), &requests);
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn batch_order_changes_the_script() {
        let first = InvocationRequest::new("a", vec![]);
        let second = InvocationRequest::new("b", vec![]);
        let forward = build_batch_script(&contract(), &[first.clone(), second.clone()]);
        let reversed = build_batch_script(&contract(), &[second, first]);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn batch_script_is_concatenation_of_single_calls() {
        let first = InvocationRequest::new("a", vec![InvokeArg::Integer(1)]);
        let second = InvocationRequest::new("b", vec![InvokeArg::Bytes(vec![0xff])]);
        let combined = build_batch_script(&contract(), &[first.clone(), second.clone()]);
        let mut expected = build_batch_script(&contract(), &[first]);
        expected.extend(build_batch_script(&contract(), &[second]));
        assert_eq!(combined, expected);
    }

    #[test]
    fn long_payloads_use_wider_length_prefix() {
        let short = InvocationRequest::new("m", vec![InvokeArg::Bytes(vec![0xaa; 255])]);
        let long = InvocationRequest::new("m", vec![InvokeArg::Bytes(vec![0xaa; 256])]);
        let short_script = build_batch_script(&contract(), &[short]);
        let long_script = build_batch_script(&contract(), &[long]);
        // one more payload byte plus one extra length byte
        assert_eq!(long_script.len(), short_script.len() + 2);
    }

    #[test]
    fn nested_lists_encode() {
        let request = InvocationRequest::new(
            "m",
            vec![InvokeArg::List(vec![
                InvokeArg::String("x".into()),
                InvokeArg::List(vec![InvokeArg::Integer(-1)]),
            ])],
        );
        let script = build_batch_script(&contract(), &[request]);
        assert!(script.len() > 21);
    }
}
