//! Database Module - Persistenz-Kollaborateur
//!
//! Hält das lokale Verzeichnis der Familienmitglieder in SQLite. Der
//! Signalisierungs-Kern benutzt nur die Lesepfade und den Status-Writer.

mod members;

pub use members::{DatabaseError, FamilyDirectory, Member, NewMember};
