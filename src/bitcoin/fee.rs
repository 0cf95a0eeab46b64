//! Byte-weight fee estimation (§4.2.2, §4.2.3).
//!
//! The estimator works over counts of input/output *types* rather than
//! concrete scripts, so it can be recomputed cheaply after every UTXO added
//! during coin selection.

use std::collections::HashMap;

/// The only input type this federator multisig produces or spends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputType {
    P2wsh { signers_required: usize, total_signers: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputType {
    OpReturn { payload_len: usize },
    P2wpkh,
    P2wsh,
    P2pkh,
    P2sh,
}

const WITNESS_MARKER_ADJUSTMENT_WU: u64 = 2;

/// Non-witness + witness weight of a single P2WSH multisig input, in weight
/// units, for a script requiring `signers_required` of `total_signers`
/// signatures.
fn p2wsh_input_weight(signers_required: usize, total_signers: usize) -> u64 {
    // Non-witness part: outpoint (36) + scriptSig len (1, empty) + sequence (4), * 4 WU/byte.
    let non_witness_bytes = 36 + 1 + 4;
    // Witness part: item count + empty first item (OP_CHECKMULTISIG off-by-one bug) +
    // one (sig-len, sig) pair per required signer + witness-script push.
    let sig_bytes = signers_required * (1 + 72);
    let witness_script_len = 1 + total_signers * 34 + 3; // rough upper bound for push opcodes + pubkeys
    let witness_bytes = 1 + 1 + sig_bytes + 1 + witness_script_len;
    (non_witness_bytes as u64) * 4 + witness_bytes as u64
}

fn output_weight(output: &OutputType) -> u64 {
    let script_len: u64 = match output {
        OutputType::OpReturn { payload_len } => 1 + 1 + *payload_len as u64,
        OutputType::P2wpkh => 22,
        OutputType::P2wsh => 34,
        OutputType::P2pkh => 25,
        OutputType::P2sh => 23,
    };
    // amount (8) + varint scriptPubKey len (1) + script, all non-witness, * 4 WU/byte.
    (8 + 1 + script_len) * 4
}

/// Estimate the virtual size (in vBytes, rounded up) of a transaction with
/// the given input/output type counts.
pub fn estimate_vsize(inputs: &HashMap<InputType, usize>, outputs: &HashMap<OutputType, usize>) -> u64 {
    let mut weight = 4 * 4; // version (4 bytes) + locktime (4 bytes), non-witness.
    weight += WITNESS_MARKER_ADJUSTMENT_WU;
    weight += 4; // varint for input count, upper bound.
    weight += 4; // varint for output count, upper bound.

    for (input_type, count) in inputs {
        let InputType::P2wsh { signers_required, total_signers } = input_type;
        weight += p2wsh_input_weight(*signers_required, *total_signers) * *count as u64;
    }
    for (output_type, count) in outputs {
        weight += output_weight(output_type) * *count as u64;
    }

    // ceil(weight / 4)
    (weight + 3) / 4
}

/// Fee in satoshis for the given input/output mix at `sat_per_vbyte`.
pub fn estimate_fee(
    inputs: &HashMap<InputType, usize>,
    outputs: &HashMap<OutputType, usize>,
    sat_per_vbyte: u64,
) -> u64 {
    estimate_vsize(inputs, outputs) * sat_per_vbyte
}

/// Applies the 5% safety margin to an RPC-estimated fee rate (§4.2.3).
pub fn apply_safety_margin(sat_per_vbyte: u64) -> u64 {
    sat_per_vbyte + (sat_per_vbyte * 5).div_ceil(100)
}

pub const REGTEST_FEE_RATE_SAT_VB: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsize_grows_with_input_count() {
        let mut inputs = HashMap::new();
        inputs.insert(InputType::P2wsh { signers_required: 2, total_signers: 3 }, 1);
        let outputs = HashMap::new();
        let one_input = estimate_vsize(&inputs, &outputs);

        inputs.insert(InputType::P2wsh { signers_required: 2, total_signers: 3 }, 2);
        let two_inputs = estimate_vsize(&inputs, &outputs);
        assert!(two_inputs > one_input);
    }

    #[test]
    fn op_return_payload_increases_weight_linearly() {
        let inputs = HashMap::new();
        let mut outputs = HashMap::new();
        outputs.insert(OutputType::OpReturn { payload_len: 10 }, 1);
        let small = estimate_vsize(&inputs, &outputs);
        outputs.insert(OutputType::OpReturn { payload_len: 40 }, 1);
        let large = estimate_vsize(&inputs, &outputs);
        assert!(large > small);
    }

    #[test]
    fn safety_margin_rounds_up() {
        assert_eq!(apply_safety_margin(10), 11);
        assert_eq!(apply_safety_margin(100), 105);
    }
}
