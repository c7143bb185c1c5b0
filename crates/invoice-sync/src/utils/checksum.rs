use sha2::{Digest, Sha256};

/// 载荷 SHA-256 校验和（小写十六进制）
///
/// 本地快照和远端对象用同一个函数计算，冲突检测只比较这个字符串。
pub fn payload_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            payload_checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_different_payloads_differ() {
        assert_ne!(payload_checksum(b"invoice v1"), payload_checksum(b"invoice v2"));
        assert_eq!(payload_checksum(b"same"), payload_checksum(b"same"));
    }
}
