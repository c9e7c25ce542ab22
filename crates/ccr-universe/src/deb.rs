//! Debian package sources.
//!
//! A `.deb` is an `ar` container whose `data.tar.gz` (or `data.tar`) member
//! holds the packaged files.

use sha2::{Digest, Sha256};

use tracing::{debug, info};

use crate::cache::{Cache, Fileset};
use crate::error::{UniverseError, UniverseResult};
use crate::target::Pseudo;

const AR_MAGIC: &[u8] = b"!<arch>\n";
const AR_HEADER_LEN: usize = 60;

/// The files packaged in the deb referenced by `src`.
pub fn deb_fileset(cache: &Cache, src: &Pseudo) -> UniverseResult<Fileset> {
    let data = package_bytes(cache, src)?;
    verify_sha256(&data, &src.sha256)?;
    let files = data_member(&data)?;
    debug!(package = %src.path, files = files.len(), "unpacked deb");
    Ok(files)
}

/// The raw archive: a path relative to the defining directory, a previous
/// download kept in the cache, or a fresh download.
fn package_bytes(cache: &Cache, src: &Pseudo) -> UniverseResult<Vec<u8>> {
    if src.url.is_empty() {
        let path = src.contract_dir.join(&src.file);
        return std::fs::read(&path).map_err(|e| UniverseError::io(path, e));
    }

    let key = src.sha256.to_lowercase();
    if let Some(path) = cache.by_name(&key) {
        return std::fs::read(&path).map_err(|e| UniverseError::io(path, e));
    }
    let data = download(&src.url)?;
    verify_sha256(&data, &src.sha256)?;
    cache.put_named(&key, &data)?;
    Ok(data)
}

pub fn download(url: &str) -> UniverseResult<Vec<u8>> {
    info!(url, "downloading");
    let fail = |e: reqwest::Error| UniverseError::generation(format!("fetching {}: {}", url, e));
    let response = reqwest::blocking::get(url).map_err(fail)?;
    let status = response.status();
    if !status.is_success() {
        return Err(UniverseError::generation(format!(
            "fetching {}: unexpected response code {}",
            url, status
        )));
    }
    Ok(response.bytes().map_err(fail)?.to_vec())
}

pub fn verify_sha256(data: &[u8], want: &str) -> UniverseResult<()> {
    let got = hex::encode(Sha256::digest(data));
    if got != want.to_lowercase() {
        return Err(UniverseError::generation(format!(
            "sha256 mismatch: got {} but expected {}",
            got, want
        )));
    }
    Ok(())
}

/// Members of an `ar` archive as `(name, bytes)`.
fn ar_members(data: &[u8]) -> UniverseResult<Vec<(String, &[u8])>> {
    let bad = |msg: &str| UniverseError::generation(format!("failed decoding deb: {}", msg));
    let mut rest = data.strip_prefix(AR_MAGIC).ok_or_else(|| bad("not an ar archive"))?;
    let mut members = Vec::new();
    while !rest.is_empty() {
        if rest.len() < AR_HEADER_LEN {
            return Err(bad("truncated member header"));
        }
        let (header, body) = rest.split_at(AR_HEADER_LEN);
        if &header[58..60] != b"`\n" {
            return Err(bad("bad member header terminator"));
        }
        let name = String::from_utf8_lossy(&header[..16])
            .trim_end()
            .trim_end_matches('/')
            .to_string();
        let size: usize = std::str::from_utf8(&header[48..58])
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| bad("bad member size"))?;
        if body.len() < size {
            return Err(bad("truncated member"));
        }
        members.push((name, &body[..size]));
        let padded = size + size % 2;
        rest = &body[padded.min(body.len())..];
    }
    Ok(members)
}

fn data_member(data: &[u8]) -> UniverseResult<Fileset> {
    for (name, body) in ar_members(data)? {
        match name.as_str() {
            "data.tar.gz" => return Fileset::read_tar_gz(body),
            "data.tar" => return Fileset::read_tar(body),
            n if n.starts_with("data.tar") => {
                return Err(UniverseError::generation(format!(
                    "unsupported deb data compression {}",
                    n
                )))
            }
            _ => {}
        }
    }
    Err(UniverseError::generation("deb has no data member"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::FileEntry;
    use crate::target::PseudoKind;

    fn ar_entry(out: &mut Vec<u8>, name: &str, body: &[u8]) {
        let header = format!(
            "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
            name, 0, 0, 0, 100644, body.len()
        );
        assert_eq!(header.len(), AR_HEADER_LEN);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(body);
        if body.len() % 2 == 1 {
            out.push(b'\n');
        }
    }

    /// A minimal deb holding `files`.
    pub(crate) fn make_deb(files: &Fileset) -> Vec<u8> {
        let data = files.write_tar_gz(Vec::new()).unwrap();
        let mut out = AR_MAGIC.to_vec();
        ar_entry(&mut out, "debian-binary", b"2.0\n");
        ar_entry(&mut out, "control.tar.gz", b"x");
        ar_entry(&mut out, "data.tar.gz", &data);
        out
    }

    fn sample() -> Fileset {
        [FileEntry::file("./usr/lib/libz.so.1", 0o644, b"elf".to_vec())]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_reads_data_member() {
        let fs = data_member(&make_deb(&sample())).unwrap();
        assert_eq!(fs.find("/usr/lib/libz.so.1").unwrap().data, b"elf");
    }

    #[test]
    fn test_rejects_data_escaping_the_root() {
        let mut header = tar::Header::new_old();
        let name = b"./../../etc/passwd";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(1);
        header.set_cksum();
        let mut data = tar::Builder::new(Vec::new());
        data.append(&header, &b"x"[..]).unwrap();
        let data = data.into_inner().unwrap();

        let mut deb = AR_MAGIC.to_vec();
        ar_entry(&mut deb, "debian-binary", b"2.0\n");
        ar_entry(&mut deb, "data.tar", &data);
        let err = data_member(&deb).unwrap_err();
        assert!(err.to_string().contains("escapes the output root"));
    }

    #[test]
    fn test_rejects_non_ar() {
        let err = data_member(b"PK\x03\x04").unwrap_err();
        assert!(err.to_string().contains("not an ar archive"));
    }

    #[test]
    fn test_local_deb_is_verified() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache")).unwrap();
        let deb = make_deb(&sample());
        std::fs::write(dir.path().join("z.deb"), &deb).unwrap();

        let mut src = Pseudo {
            kind: PseudoKind::Deb,
            path: "//pkgs:z".into(),
            name: "z".into(),
            pos: None,
            contract_dir: dir.path().to_path_buf(),
            file: "z.deb".into(),
            url: String::new(),
            sha256: hex::encode(Sha256::digest(&deb)).to_uppercase(),
            host: false,
            details: Vec::new(),
        };
        assert_eq!(deb_fileset(&cache, &src).unwrap().len(), 1);

        src.sha256 = "00".repeat(32);
        let err = deb_fileset(&cache, &src).unwrap_err();
        assert!(err.to_string().contains("sha256 mismatch"));
    }

    #[test]
    fn test_downloaded_deb_served_from_named_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        let deb = make_deb(&sample());
        let sha = hex::encode(Sha256::digest(&deb));
        cache.put_named(&sha, &deb).unwrap();

        let src = Pseudo {
            kind: PseudoKind::Deb,
            path: "//pkgs:z".into(),
            name: "z".into(),
            pos: None,
            contract_dir: dir.path().to_path_buf(),
            file: String::new(),
            url: "http://invalid.example/z.deb".into(),
            sha256: sha,
            host: false,
            details: Vec::new(),
        };
        assert_eq!(deb_fileset(&cache, &src).unwrap().len(), 1);
    }
}
