//! Key layout shared by the file and cloud backends:
//! `content/<YYYY>/<MM>/<DD>/<hh>/<mm>/<blobId>.{bytes,properties}`.

use crate::blob::BlobId;

pub const CONTENT_DIR: &str = "content";
pub const BYTES_EXTENSION: &str = "bytes";
pub const PROPERTIES_EXTENSION: &str = "properties";

/// Ids without an embedded creation stamp live outside the date partitions.
const UNPARTITIONED_DIR: &str = "unpartitioned";

/// Relative path of a blob without extension, e.g.
/// `content/2024/06/15/12/30/<id>`.
pub fn blob_stem(id: &BlobId) -> String {
    match id.date_path() {
        Some(date) => format!("{CONTENT_DIR}/{date}/{id}"),
        None => format!("{CONTENT_DIR}/{UNPARTITIONED_DIR}/{id}"),
    }
}

pub fn bytes_key(id: &BlobId) -> String {
    format!("{}.{BYTES_EXTENSION}", blob_stem(id))
}

pub fn properties_key(id: &BlobId) -> String {
    format!("{}.{PROPERTIES_EXTENSION}", blob_stem(id))
}
