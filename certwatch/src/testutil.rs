use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, date_time_ymd};
use std::path::Path;
use std::time::SystemTime;

/// What to put in a generated test certificate
pub struct PairParams {
    sans: Vec<String>,
    common_name: String,
    expired: bool,
    not_yet_valid: bool,
}

impl PairParams {
    pub fn new(sans: &[&str], common_name: &str) -> Self {
        Self {
            sans: sans.iter().map(|s| s.to_string()).collect(),
            common_name: common_name.to_string(),
            expired: false,
            not_yet_valid: false,
        }
    }

    pub fn expired(mut self) -> Self {
        self.expired = true;
        self
    }

    pub fn not_yet_valid(mut self) -> Self {
        self.not_yet_valid = true;
        self
    }
}

/// Generate a self-signed pair and write `<stem>.crt`/`<stem>.key` into `dir`.
/// Returns the pair name.
pub fn write_pair(dir: &Path, stem: &str, pair: &PairParams) -> String {
    let mut params = CertificateParams::new(pair.sans.clone()).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, pair.common_name.as_str());
    params.distinguished_name = dn;
    if pair.expired {
        params.not_before = date_time_ymd(2000, 1, 1);
        params.not_after = date_time_ymd(2001, 1, 1);
    }
    if pair.not_yet_valid {
        params.not_before = date_time_ymd(2200, 1, 1);
        params.not_after = date_time_ymd(2201, 1, 1);
    }

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    std::fs::write(dir.join(format!("{stem}.key")), key_pair.serialize_pem()).unwrap();
    std::fs::write(dir.join(format!("{stem}.crt")), cert.pem()).unwrap();
    dir.join(stem).to_string_lossy().to_string()
}

pub fn set_modified(path: &Path, time: SystemTime) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}
