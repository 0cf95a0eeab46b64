//! Pure PSBT construction: coin selection, fee recomputation, OP_RETURN
//! nonce payload, and output ordering (§4.2, §6 "Bitcoin transaction layout").

use std::collections::HashMap;

use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::psbt::{Input as PsbtInput, Psbt};
use bitcoin::script::Builder;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::bitcoin::address::MultisigAddress;
use crate::bitcoin::fee::{estimate_fee, InputType, OutputType};
use crate::domain::transfer::{Transfer, RESERVED_NONCE};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub confirmations: u32,
    pub script_pubkey: ScriptBuf,
}

pub struct BuildPsbtParams<'a> {
    pub utxos: &'a [Utxo],
    pub transfers: &'a [Transfer],
    pub multisig: &'a MultisigAddress,
    pub fee_sat_per_vbyte: u64,
    pub no_change: bool,
    pub max_inputs: Option<usize>,
}

/// Build an unsigned PSBT per §6's output layout: `OP_RETURN <nonces>`, then
/// one payment output per transfer, then (unless `no_change`) change back to
/// the canonical multisig address.
pub fn build_unsigned_psbt(params: BuildPsbtParams) -> Result<Psbt> {
    let BuildPsbtParams {
        utxos,
        transfers,
        multisig,
        fee_sat_per_vbyte,
        no_change,
        max_inputs,
    } = params;

    if transfers.is_empty() {
        return Err(Error::validation("cannot build a PSBT for zero transfers"));
    }
    validate_nonces(transfers)?;

    let mut sorted_utxos = utxos.to_vec();
    // "sorted by confirmations descending (oldest first)" (§4.2.2).
    sorted_utxos.sort_by(|a, b| b.confirmations.cmp(&a.confirmations));
    if let Some(max) = max_inputs {
        sorted_utxos.truncate(max.max(sorted_utxos.len().min(max)));
    }

    let op_return_payload: Vec<u8> = transfers.iter().map(|t| t.nonce).collect();
    let total_payout: u64 = transfers.iter().map(|t| t.total_amount_sat).sum();

    let mut outputs = HashMap::new();
    outputs.insert(OutputType::OpReturn { payload_len: op_return_payload.len() }, 1);
    outputs.insert(OutputType::P2wpkh, transfers.len()); // conservative: worst case per-dest weight
    if !no_change {
        outputs.insert(OutputType::P2wsh, 1);
    }

    let mut selected: Vec<Utxo> = Vec::new();
    let mut input_counts = HashMap::new();
    let mut selected_sum: u64 = 0;

    for utxo in sorted_utxos {
        if let Some(max) = max_inputs {
            if selected.len() >= max {
                break;
            }
        }
        selected_sum += utxo.amount.to_sat();
        selected.push(utxo);
        *input_counts
            .entry(InputType::P2wsh {
                signers_required: multisig.required_signers,
                total_signers: multisig.total_signers,
            })
            .or_insert(0) += 1;

        let fee = estimate_fee(&input_counts, &outputs, fee_sat_per_vbyte);
        if selected_sum >= total_payout + fee {
            break;
        }
    }

    let fee = estimate_fee(&input_counts, &outputs, fee_sat_per_vbyte);
    if selected_sum < total_payout + fee {
        return Err(Error::Bitcoin(format!(
            "insufficient multisig funds: have {selected_sum} sat, need {} sat (payout {total_payout} + fee {fee})",
            total_payout + fee
        )));
    }

    let change_amount = if no_change {
        0
    } else {
        selected_sum - total_payout - fee
    };
    if no_change {
        // The single transfer absorbs all remaining value after fees (§4.9).
        // Not enforced here: caller passes a single-transfer batch already
        // sized to `selected_sum - fee`.
    }

    let mut tx_outs = Vec::new();
    let op_return_script = Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(bitcoin::script::PushBytesBuf::try_from(op_return_payload).map_err(|e| Error::Bitcoin(e.to_string()))?)
        .into_script();
    tx_outs.push(TxOut { value: Amount::from_sat(0), script_pubkey: op_return_script });

    for transfer in transfers {
        let address: Address = transfer
            .btc_address
            .parse::<Address<bitcoin::address::NetworkUnchecked>>()
            .map_err(|e| Error::validation(format!("invalid destination address {}: {e}", transfer.btc_address)))?
            .require_network(multisig.address.network().clone())
            .map_err(|e| Error::validation(format!("address {} is for the wrong network: {e}", transfer.btc_address)))?;
        tx_outs.push(TxOut {
            value: Amount::from_sat(transfer.total_amount_sat),
            script_pubkey: address.script_pubkey(),
        });
    }

    if !no_change && change_amount > 0 {
        tx_outs.push(TxOut {
            value: Amount::from_sat(change_amount),
            script_pubkey: multisig.address.script_pubkey(),
        });
    }

    let tx_ins: Vec<TxIn> = selected
        .iter()
        .map(|u| TxIn {
            previous_output: u.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        })
        .collect();

    let unsigned_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: tx_ins,
        output: tx_outs,
    };

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)
        .map_err(|e| Error::Bitcoin(format!("psbt construction failed: {e}")))?;

    for (i, utxo) in selected.iter().enumerate() {
        psbt.inputs[i] = PsbtInput {
            witness_utxo: Some(TxOut {
                value: utxo.amount,
                script_pubkey: utxo.script_pubkey.clone(),
            }),
            witness_script: Some(multisig.witness_script.clone()),
            ..Default::default()
        };
    }

    Ok(psbt)
}

/// Nonces must be in `0..254`; `(address, nonce)` unique within the batch (§4.2.5).
fn validate_nonces(transfers: &[Transfer]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for t in transfers {
        if t.nonce == RESERVED_NONCE {
            return Err(Error::validation(format!("nonce {RESERVED_NONCE} is reserved")));
        }
        if !seen.insert((t.btc_address.to_lowercase(), t.nonce)) {
            return Err(Error::validation(format!(
                "duplicate (address, nonce) pair in batch: ({}, {})",
                t.btc_address, t.nonce
            )));
        }
    }
    Ok(())
}

/// Read back the nonce payload from a PSBT's OP_RETURN output, per
/// `get_transfers_from` (§4.2, §4.4 PSBT validation).
pub fn read_op_return_nonces(psbt: &Psbt) -> Result<Vec<u8>> {
    let output0 = psbt
        .unsigned_tx
        .output
        .first()
        .ok_or_else(|| Error::validation("psbt has no outputs"))?;
    let mut instructions = output0.script_pubkey.instructions();
    match instructions.next() {
        Some(Ok(bitcoin::script::Instruction::Op(op))) if op == OP_RETURN => {}
        _ => return Err(Error::validation("output 0 is not an OP_RETURN")),
    }
    match instructions.next() {
        Some(Ok(bitcoin::script::Instruction::PushBytes(bytes))) => Ok(bytes.as_bytes().to_vec()),
        _ => Err(Error::validation("OP_RETURN output has no data push")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::fixtures::{sample_multisig, sample_transfer, sample_utxo};

    #[test]
    fn builds_psbt_with_op_return_first() {
        let multisig = sample_multisig();
        let transfer = sample_transfer(0, 100_000);
        let utxo = sample_utxo(&multisig, 10_000_000, 6);
        let psbt = build_unsigned_psbt(BuildPsbtParams {
            utxos: &[utxo],
            transfers: &[transfer],
            multisig: &multisig,
            fee_sat_per_vbyte: 10,
            no_change: false,
            max_inputs: None,
        })
        .unwrap();
        assert_eq!(psbt.unsigned_tx.output[0].value, Amount::from_sat(0));
        let nonces = read_op_return_nonces(&psbt).unwrap();
        assert_eq!(nonces, vec![0u8]);
    }

    #[test]
    fn rejects_reserved_nonce() {
        let multisig = sample_multisig();
        let transfer = sample_transfer(RESERVED_NONCE, 100_000);
        let utxo = sample_utxo(&multisig, 10_000_000, 6);
        let result = build_unsigned_psbt(BuildPsbtParams {
            utxos: &[utxo],
            transfers: &[transfer],
            multisig: &multisig,
            fee_sat_per_vbyte: 10,
            no_change: false,
            max_inputs: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn errors_when_funds_insufficient() {
        let multisig = sample_multisig();
        let transfer = sample_transfer(0, 100_000);
        let utxo = sample_utxo(&multisig, 1000, 6);
        let result = build_unsigned_psbt(BuildPsbtParams {
            utxos: &[utxo],
            transfers: &[transfer],
            multisig: &multisig,
            fee_sat_per_vbyte: 10,
            no_change: false,
            max_inputs: None,
        });
        assert!(result.is_err());
    }
}
