//! Parsers for the GRUB script fragments we read and write.

pub mod custom_cfg;
pub mod tokenizer;
