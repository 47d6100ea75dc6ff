//! The stream sentinel: operator-visible bounds for the CDC pipeline.
//!
//! `stream sentinel set endpos <lsn>` can be issued while replay is live;
//! the receiver and applier poll the sentinel and wind down once the
//! position is reached. The `apply` flag gates the applier during bulk
//! copy: changes buffer on disk until the copy is done.

use anyhow::{Context, Result};

use crate::catalog::Catalog;
use crate::lsn::Lsn;
use crate::plan::Sentinel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SentinelField {
    Startpos,
    Endpos,
    Apply,
}

pub fn get(catalog: &Catalog) -> Result<Sentinel> {
    catalog.sentinel_read()
}

pub fn render(sentinel: &Sentinel) -> String {
    format!(
        "startpos {}\nendpos   {}\napply    {}",
        sentinel.start_pos, sentinel.end_pos, sentinel.apply
    )
}

pub fn set(catalog: &Catalog, field: SentinelField, value: &str) -> Result<Sentinel> {
    let mut sentinel = catalog.sentinel_read()?;
    match field {
        SentinelField::Startpos => {
            sentinel.start_pos = value
                .parse::<Lsn>()
                .with_context(|| format!("invalid startpos {value:?}"))?;
        }
        SentinelField::Endpos => {
            sentinel.end_pos = value
                .parse::<Lsn>()
                .with_context(|| format!("invalid endpos {value:?}"))?;
        }
        SentinelField::Apply => {
            sentinel.apply = value
                .parse::<bool>()
                .with_context(|| format!("invalid apply flag {value:?}"))?;
        }
    }
    catalog.sentinel_write(sentinel)?;
    Ok(sentinel)
}
