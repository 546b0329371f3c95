pub mod git;
pub mod installer;
pub mod ledger;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod search;
