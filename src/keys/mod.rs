//! Wallet keys. [`HdKey`] derives hierarchical deterministic key chains over
//! secp256k1, in both spending (private) and watch-only (public) form.

mod hdkey;

pub use hdkey::HdKey;
