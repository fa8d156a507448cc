use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use enr::{CombinedKey, Enr};

const SCHEME: &str = "discv5fs://";

/// A reference to a file on a remote node:
///  `discv5fs://<enr without the "enr:" prefix>/<file path>`.
#[derive(Debug, Clone)]
pub struct TransferRef {
    pub node: Enr<CombinedKey>,
    pub file: String,
}

impl TransferRef {
    pub fn parse(text: &str) -> anyhow::Result<TransferRef> {
        let rest = match text.strip_prefix(SCHEME) {
            Some(rest) => rest,
            None => bail!("missing/wrong URL scheme"),
        };
        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host, path),
            None => bail!("empty file path"),
        };
        if path.is_empty() {
            bail!("empty file path");
        }
        let node = match Enr::from_str(&format!("enr:{}", host)) {
            Ok(node) => node,
            Err(_) => bail!("invalid ENR host"),
        };
        Ok(TransferRef {
            node,
            file: path.to_string(),
        })
    }
}

impl fmt::Display for TransferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let enr = self.node.to_base64();
        let host = enr.strip_prefix("enr:").unwrap_or(&enr);
        write!(f, "{}{}/{}", SCHEME, host, self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn test_enr() -> Enr<CombinedKey> {
        let key = CombinedKey::generate_secp256k1();
        Enr::builder()
            .ip4("127.0.0.1".parse().unwrap())
            .udp4(30303)
            .build(&key)
            .unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let node = test_enr();
        let reference = TransferRef {
            node: node.clone(),
            file: "path/to/file".to_string(),
        };

        let parsed = TransferRef::parse(&reference.to_string()).unwrap();
        assert_eq!(parsed.node, node);
        assert_eq!(parsed.file, "path/to/file");
    }

    #[rstest]
    #[case::missing_scheme("example.com/file")]
    #[case::wrong_scheme("https://example.com/file")]
    #[case::no_path_separator("discv5fs://abcdef")]
    #[case::empty_path("discv5fs://abcdef/")]
    #[case::invalid_enr("discv5fs://not-a-record/file")]
    fn test_parse_rejects(#[case] text: &str) {
        assert!(TransferRef::parse(text).is_err());
    }
}
