//! Parsed stream structures: pages, packets, headers, and the setup
//! components (codebooks, floors, residues, mappings, modes).

pub mod codebook;
pub mod floor;
pub mod header;
pub mod mapping;
pub mod mode;
pub mod packet;
pub mod page;
pub mod residue;
