mod catalog;
mod download;
mod hashing;
mod paths;
mod validate;

pub use catalog::{builtin_models, find_model, normalize_source_url, ModelDescriptor};
pub use download::{
    fetch_with_retry, DownloadError, FetchRequest, HttpDownloader, ModelFetcher, RetryPolicy,
};
pub use hashing::{ContentHasher, Sha256Hasher, Sha256Stream};
pub use paths::{ModelStorage, StorageError};
pub use validate::{ValidationResult, Validator};
