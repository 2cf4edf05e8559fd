//! Embedding lookup.

use recur::{Error, Result, Tensor};

use super::check_host;

/// Row `token` of a `[vocab, dim]` table, as a zero-copy view.
pub fn embedding(table: &Tensor, token: u32) -> Result<Tensor> {
    check_host("embedding", table)?;
    let [vocab, dim] = table.shape() else {
        return Err(Error::InvalidShape(format!(
            "embedding table must be 2-D, got {:?}",
            table.shape()
        )));
    };
    let row = token as usize;
    if row >= *vocab {
        return Err(Error::InvalidShape(format!(
            "token {token} outside vocabulary of {vocab}"
        )));
    }
    table.slice_view(row * dim, &[*dim])
}
