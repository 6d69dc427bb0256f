pub mod aws_kms;
pub mod local;

pub use aws_kms::AwsKmsEncryptionProvider;
pub use local::LocalEncryptionProvider;
