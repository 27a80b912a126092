#[cfg(feature = "url_encoding")]
pub mod url_encoding;

#[cfg(feature = "ende")]
pub mod ende;

#[cfg(feature = "compression")]
pub mod compression;
