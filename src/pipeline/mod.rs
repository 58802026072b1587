//! Pipeline stages for certificate mail-merge.
//!
//! Each submodule implements exactly one step. Render, convert and deliver
//! are traits so the orchestrator can run injected collaborators (tests,
//! alternative engines) through the same per-record state machine.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ render ──▶ convert ──▶ deliver
//! (path/URL) (CSV/XLSX)  (template)  (soffice)   (SMTP)
//! ```
//!
//! 1. [`input`]: load the user-supplied path or URL into memory
//! 2. [`extract`]: parse the sheet into ordered [`crate::Record`]s
//! 3. [`render`]: fill the template for one record ([`docx`] for Word
//!    templates)
//! 4. [`convert`]: turn the rendered document into the deliverable format;
//!    serialised through the conversion gate unless the converter is reentrant
//! 5. [`deliver`]: mail the converted document to the record's address

pub mod convert;
pub mod deliver;
pub mod docx;
pub mod extract;
pub mod input;
pub mod render;
