//! Compact device selector syntax.
//!
//! Operators address devices with a single token of optional segments,
//! each introduced by a sigil and all of them ANDed together:
//!
//! ```text
//! d<id>r<region>z<zone>-<ip>:<port>R<rep_ip>:<rep_port>/<name>_<meta>
//! ```
//!
//! Every segment is optional but the order is fixed, so `d0`, `/sda1`,
//! `z0-127.0.0.1`, `:6200`, `R127.0.0.1` and `_some meta data` are all
//! valid tokens. IPv6 addresses must be bracketed, `-[::1]:6200`. String
//! segments match as substrings, numeric segments exactly.
//!
//! The same grammar, with the weight passed separately and the identity
//! segments mandatory, describes a device to `add`:
//!
//! ```text
//! r<region>z<zone>-<ip>:<port>[R<rep_ip>:<rep_port>]/<name>[_<meta>]
//! ```

use anyhow::{Context, Result, anyhow, bail};
use torus_ring::{DeviceSpec, InfoChanges, SearchCriteria, normalize_address};

/// Parse a selector token into search criteria.
pub fn parse_search_token(token: &str) -> Result<SearchCriteria> {
    let mut cur = Cursor::new(token);
    let mut criteria = SearchCriteria::default();

    if cur.eat('d') {
        criteria.id = Some(cur.number().context("bad device id")?);
    }
    if cur.eat('r') {
        criteria.region = Some(cur.number().context("bad region")?);
    }
    if cur.eat('z') {
        criteria.zone = Some(cur.number().context("bad zone")?);
    }
    if cur.eat('-') {
        criteria.ip = Some(cur.address()?);
    }
    if cur.eat(':') {
        criteria.port = Some(cur.number().context("bad port")?);
    }
    if cur.eat('R') {
        criteria.replication_ip = Some(cur.address()?);
        if cur.eat(':') {
            criteria.replication_port = Some(cur.number().context("bad replication port")?);
        }
    }
    if cur.eat('/') {
        criteria.name = Some(cur.until(&['_']).to_string());
    }
    if cur.eat('_') {
        criteria.meta = Some(cur.rest().to_string());
    }
    if !cur.done() {
        bail!("unparsed trailing input {:?} in selector {token:?}", cur.rest());
    }
    if criteria.is_empty() {
        bail!("empty selector {token:?}");
    }
    Ok(criteria)
}

/// Parse an `add` token into a device spec. `weight` is supplied by the
/// caller from its own argument.
pub fn parse_add_spec(token: &str, weight: f64) -> Result<DeviceSpec> {
    let mut cur = Cursor::new(token);
    let mut spec = DeviceSpec {
        weight,
        ..Default::default()
    };

    if cur.eat('d') {
        spec.id = Some(cur.number().context("bad device id")?);
    }
    if !cur.eat('r') {
        bail!("device token must start with r<region>: {token:?}");
    }
    spec.region = cur.number().context("bad region")?;
    if !cur.eat('z') {
        bail!("device token needs z<zone>: {token:?}");
    }
    spec.zone = cur.number().context("bad zone")?;
    if !cur.eat('-') {
        bail!("device token needs -<ip>: {token:?}");
    }
    spec.ip = cur.address()?;
    if !cur.eat(':') {
        bail!("device token needs :<port>: {token:?}");
    }
    spec.port = cur.number().context("bad port")?;
    if cur.eat('R') {
        spec.replication_ip = Some(cur.address()?);
        if !cur.eat(':') {
            bail!("replication address needs :<port>: {token:?}");
        }
        spec.replication_port = Some(cur.number().context("bad replication port")?);
    }
    if !cur.eat('/') {
        bail!("device token needs /<name>: {token:?}");
    }
    spec.name = cur.until(&['_']).to_string();
    if cur.eat('_') {
        spec.meta = cur.rest().to_string();
    }
    if !cur.done() {
        bail!("unparsed trailing input {:?} in device token {token:?}", cur.rest());
    }
    Ok(spec)
}

/// Parse a `set_info` change token. Same grammar as a selector, but only
/// the identity segments are meaningful and each present segment becomes
/// the device's new value.
pub fn parse_info_changes(token: &str) -> Result<InfoChanges> {
    let mut cur = Cursor::new(token);
    let mut changes = InfoChanges::default();

    if cur.eat('-') {
        changes.ip = Some(cur.address()?);
    }
    if cur.eat(':') {
        changes.port = Some(cur.number().context("bad port")?);
    }
    if cur.eat('R') {
        changes.replication_ip = Some(cur.address()?);
        if cur.eat(':') {
            changes.replication_port = Some(cur.number().context("bad replication port")?);
        }
    }
    if cur.eat('/') {
        changes.name = Some(cur.until(&['_']).to_string());
    }
    if cur.eat('_') {
        changes.meta = Some(cur.rest().to_string());
    }
    if !cur.done() {
        bail!("unparsed trailing input {:?} in change token {token:?}", cur.rest());
    }
    if changes.ip.is_none()
        && changes.port.is_none()
        && changes.replication_ip.is_none()
        && changes.replication_port.is_none()
        && changes.name.is_none()
        && changes.meta.is_none()
    {
        bail!("empty change token {token:?}");
    }
    Ok(changes)
}

/// Character-by-character scanner over a selector token.
struct Cursor<'t> {
    rest: &'t str,
}

impl<'t> Cursor<'t> {
    fn new(token: &'t str) -> Self {
        Self { rest: token }
    }

    /// Consume `sigil` if it is next.
    fn eat(&mut self, sigil: char) -> bool {
        match self.rest.strip_prefix(sigil) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn number<N: std::str::FromStr>(&mut self) -> Result<N> {
        let end = self
            .rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(self.rest.len());
        let (digits, rest) = self.rest.split_at(end);
        self.rest = rest;
        digits
            .parse()
            .map_err(|_| anyhow!("expected a number, got {digits:?}"))
    }

    /// An address segment: `[...]` for IPv6, otherwise up to the next
    /// sigil. Normalized before matching so `[::ffff:1.2.3.4]` and its
    /// canonical form select the same devices.
    fn address(&mut self) -> Result<String> {
        let raw = if self.rest.starts_with('[') {
            let end = self
                .rest
                .find(']')
                .ok_or_else(|| anyhow!("unterminated bracketed address"))?;
            let (addr, rest) = self.rest.split_at(end + 1);
            self.rest = rest;
            addr
        } else {
            self.until(&[':', 'R', '/', '_'])
        };
        Ok(normalize_address(raw)?)
    }

    /// Consume up to (not including) the first of `stops`, or everything.
    fn until(&mut self, stops: &[char]) -> &'t str {
        let end = self
            .rest
            .find(|c| stops.contains(&c))
            .unwrap_or(self.rest.len());
        let (taken, rest) = self.rest.split_at(end);
        self.rest = rest;
        taken
    }

    fn rest(&self) -> &'t str {
        self.rest
    }

    fn done(&self) -> bool {
        self.rest.is_empty()
    }
}
