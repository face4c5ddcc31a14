//! Builders for linked header chains and block payloads used across tests.

use alloy_consensus::constants::{EMPTY_OMMER_ROOT_HASH, EMPTY_ROOT_HASH};
use alloy_consensus::proofs::{calculate_ommers_root, calculate_transaction_root};
use alloy_consensus::TxLegacy;
use alloy_primitives::{Bytes, Signature, TxKind, B256, U256};
use reth_ethereum_primitives::{
    Block, BlockBody, Receipt, Transaction, TransactionSigned, TxType,
};
use reth_primitives_traits::{Header, SealedHeader};

use crate::sync::receipts_root;

/// Header with empty transaction, ommer, and receipt roots.
pub fn empty_header(number: u64, parent: B256) -> Header {
    let mut header = Header::default();
    header.number = number;
    header.parent_hash = parent;
    header.transactions_root = EMPTY_ROOT_HASH;
    header.ommers_hash = EMPTY_OMMER_ROOT_HASH;
    header.receipts_root = EMPTY_ROOT_HASH;
    header
}

/// Linked chain of empty-body headers covering `start..start + count`.
pub fn linked_headers(start: u64, count: u64, parent: B256) -> Vec<SealedHeader> {
    linked_headers_salted(start, count, parent, 0)
}

/// Like [`linked_headers`], with `salt` mixed into every header so two chains
/// over the same heights end in different hashes.
pub fn linked_headers_salted(start: u64, count: u64, parent: B256, salt: u64) -> Vec<SealedHeader> {
    let mut out = Vec::with_capacity(count as usize);
    let mut parent = parent;
    for number in start..start + count {
        let mut header = empty_header(number, parent);
        header.gas_limit = 30_000_000 + salt;
        let sealed = SealedHeader::seal_slow(header);
        parent = sealed.hash();
        out.push(sealed);
    }
    out
}

/// Blocks assembled from a linked chain of empty-body headers.
pub fn empty_blocks(start: u64, count: u64, parent: B256) -> Vec<Block> {
    linked_headers(start, count, parent)
        .into_iter()
        .map(|sealed| Block {
            header: sealed.header().clone(),
            body: BlockBody::default(),
        })
        .collect()
}

pub fn test_transaction(nonce: u64) -> TransactionSigned {
    let tx = TxLegacy {
        chain_id: Some(1),
        nonce,
        gas_price: 21,
        gas_limit: 21_000,
        to: TxKind::Create,
        value: U256::ZERO,
        input: Bytes::new(),
    };
    TransactionSigned::new_unhashed(Transaction::Legacy(tx), Signature::test_signature())
}

pub fn test_receipt(cumulative_gas_used: u64) -> Receipt {
    Receipt {
        tx_type: TxType::Legacy,
        success: true,
        cumulative_gas_used,
        logs: Vec::new(),
    }
}

/// Header plus the body and receipts it commits to.
#[derive(Debug, Clone)]
pub struct Payload {
    pub header: SealedHeader,
    pub body: BlockBody,
    pub receipts: Vec<Receipt>,
}

/// Linked chain of blocks carrying one transaction and one receipt each,
/// with genuinely derived transaction, ommer, and receipt roots.
pub fn linked_payloads(start: u64, count: u64, parent: B256) -> Vec<Payload> {
    let mut out = Vec::with_capacity(count as usize);
    let mut parent = parent;
    for number in start..start + count {
        let body = BlockBody {
            transactions: vec![test_transaction(number)],
            ommers: Vec::new(),
            withdrawals: None,
        };
        let receipts = vec![test_receipt(21_000)];
        let mut header = empty_header(number, parent);
        header.transactions_root = calculate_transaction_root(&body.transactions);
        header.ommers_hash = calculate_ommers_root(&body.ommers);
        header.receipts_root = receipts_root(&receipts);
        let sealed = SealedHeader::seal_slow(header);
        parent = sealed.hash();
        out.push(Payload {
            header: sealed,
            body,
            receipts,
        });
    }
    out
}
