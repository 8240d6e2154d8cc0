// SPDX-License-Identifier: AGPL-3.0

//! Hashing and canonical encodings used by the EVM

use evmsym_constants::ADDRESS_SIZE;
use rlp::RlpStream;
use sha3::{Digest, Keccak256};

/// Compute Keccak256 hash
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Address of a contract created with CREATE: the low 20 bytes of
/// keccak256(rlp([sender, nonce])).
pub fn contract_address(sender: &[u8; ADDRESS_SIZE], nonce: u64) -> [u8; ADDRESS_SIZE] {
    let mut stream = RlpStream::new_list(2);
    stream.append(&sender.to_vec());
    stream.append(&nonce);
    low_address(&keccak256(&stream.out()))
}

/// Address of a contract created with CREATE2:
/// keccak256(0xff ++ sender ++ salt ++ keccak256(init_code))[12..]
pub fn create2_address(sender: &[u8; ADDRESS_SIZE], salt: &[u8; 32], init_code: &[u8]) -> [u8; ADDRESS_SIZE] {
    let mut preimage = Vec::with_capacity(1 + 20 + 32 + 32);
    preimage.push(0xff);
    preimage.extend_from_slice(sender);
    preimage.extend_from_slice(salt);
    preimage.extend_from_slice(&keccak256(init_code));
    low_address(&keccak256(&preimage))
}

fn low_address(hash: &[u8; 32]) -> [u8; ADDRESS_SIZE] {
    let mut address = [0u8; ADDRESS_SIZE];
    address.copy_from_slice(&hash[12..]);
    address
}

/// A fully concrete log entry, as it is serialized for digests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub address: [u8; ADDRESS_SIZE],
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
}

/// Strip leading zero bytes so a 32-byte topic encodes as a big-endian integer
fn minimal_be(word: &[u8; 32]) -> Vec<u8> {
    let first = word.iter().position(|b| *b != 0).unwrap_or(word.len());
    word[first..].to_vec()
}

/// RLP encoding of `[[address, [topic...], data]...]`
pub fn rlp_logs(logs: &[LogRecord]) -> Vec<u8> {
    let mut stream = RlpStream::new_list(logs.len());
    for log in logs {
        stream.begin_list(3);
        stream.append(&log.address.to_vec());
        stream.begin_list(log.topics.len());
        for topic in &log.topics {
            stream.append(&minimal_be(topic));
        }
        stream.append(&log.data);
    }
    stream.out().to_vec()
}

/// keccak256 over the RLP-serialized log sequence
pub fn logs_digest(logs: &[LogRecord]) -> [u8; 32] {
    keccak256(&rlp_logs(logs))
}

/// Lowercase hex without prefix
pub fn to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evmsym_constants::{EMPTY_KECCAK, EMPTY_LIST_KECCAK};

    fn address(text: &str) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&hex::decode(text).unwrap());
        out
    }

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(keccak256(b""), EMPTY_KECCAK);
    }

    #[test]
    fn test_empty_logs_digest() {
        assert_eq!(rlp_logs(&[]), vec![0xc0]);
        assert_eq!(logs_digest(&[]), EMPTY_LIST_KECCAK);
        assert_eq!(
            to_hex(&logs_digest(&[])),
            "1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
        );
    }

    #[test]
    fn test_contract_address() {
        let sender = address("6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0");
        assert_eq!(
            to_hex(&contract_address(&sender, 0)),
            "cd234a471b72ba2f1ccf0a70fcaba648a5eecd8d"
        );
        assert_eq!(
            to_hex(&contract_address(&sender, 1)),
            "343c43a37d37dff08ae8c4a11544c718abb4fcf8"
        );
    }

    #[test]
    fn test_create2_address() {
        // EIP-1014 example 0
        let sender = [0u8; 20];
        let salt = [0u8; 32];
        assert_eq!(
            to_hex(&create2_address(&sender, &salt, &[0x00])),
            "4d1a2e2bb4f88f0250f26ffff098b0b30b26bf38"
        );
    }

    #[test]
    fn test_topic_encodes_as_integer() {
        let mut topic = [0u8; 32];
        topic[31] = 0x05;
        let log = LogRecord {
            address: [0x11; 20],
            topics: vec![topic],
            data: vec![],
        };
        let encoded = rlp_logs(&[log]);
        // outer list, inner list, 20-byte address string, topic list [0x05], empty data
        let mut expected = vec![0xd9, 0xd8, 0x94];
        expected.extend_from_slice(&[0x11; 20]);
        expected.extend_from_slice(&[0xc1, 0x05, 0x80]);
        assert_eq!(encoded, expected);
    }

    #[test]
    fn test_logs_digest_with_topics_and_data() {
        let mut address = [0u8; 20];
        address[19] = 0x0a;
        let topic = |low: u8| {
            let mut word = [0u8; 32];
            word[31] = low;
            word
        };
        let log = LogRecord {
            address,
            topics: vec![topic(0x11), topic(0x22)],
            data: vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee],
        };
        let encoded = rlp_logs(std::slice::from_ref(&log));
        assert_eq!(
            to_hex(&encoded),
            "dfde94000000000000000000000000000000000000000ac2112285aabbccddee"
        );
        assert_eq!(
            to_hex(&logs_digest(&[log])),
            "dc04054e78ca61e11f4f79eb2711a52760c7fe820c7c9146fb71a0efb60fdebd"
        );
    }
}
