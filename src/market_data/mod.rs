// Market data module entrypoint
pub mod adapters;       // ledger sources (XRPL JSON-RPC) + retry
pub mod asset;          // wire amounts -> canonical assets and exact decimals
pub mod metadata;       // balance changes and pool reserves from tx metadata
pub mod normaliser;     // raw transactions -> NormalizedEvent
pub mod reserves;       // AMM pool reserve series
pub mod scanner;        // drives fetch -> normalize -> table -> commit
pub mod export;         // CSV output of bars, events and reserves
