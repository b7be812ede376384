pub mod bencode;
pub mod decoder;
pub mod info_hash;
pub mod info_slice;

pub use bencode::Bencode;
pub use decoder::{decode, decode_all};
pub use info_hash::info_hash;
pub use info_slice::find_info_slice;
