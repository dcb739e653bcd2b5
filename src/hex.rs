// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wrapper around `pretty-hex` that bounds dump size in log output.

use pretty_hex::PrettyHex;

pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let omitted = self.inner.len().checked_sub(self.max_bytes);
        let print = match omitted {
            Some(_) => &self.inner[..self.max_bytes],
            None => self.inner,
        };
        writeln!(f, "{} (0x{:x}) bytes", self.inner.len(), self.inner.len())?;
        write!(
            f,
            "{:?}",
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if let Some(o) = omitted {
            write!(f, "\n...{o} more bytes not shown...")?;
        }
        Ok(())
    }
}
