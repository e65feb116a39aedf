pub mod external;
pub mod oracle;
pub mod pair;
