//! IP address allocation for overlay networks
//!
//! Each allocation scope (a network id or an explicit pool id) owns one
//! bit-vector in the store, one bit per address of its CIDR. The first
//! and last bits are reserved for the network and broadcast addresses and
//! allocation always takes the lowest clear bit.
//!
//! There is no locking here: two hosts allocating from the same scope at
//! the same time can both read the same vector and hand out the same
//! address. Callers that need exclusivity must hold a store lock around
//! the call.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::IpNet;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::{self, Keys, Store};

/// Largest supported pool: 2^20 addresses (a 128 KiB vector).
pub const MAX_HOST_BITS: u8 = 20;

/// Fixed-length bit-vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    len: usize,
    bytes: Vec<u8>,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bytes: vec![0; len.div_ceil(8)],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bytes[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bytes[index / 8] &= !(1 << (index % 8));
        }
    }

    /// Lowest unset index.
    pub fn first_clear(&self) -> Option<usize> {
        let byte = self.bytes.iter().position(|b| *b != 0xff)?;
        let index = byte * 8 + self.bytes[byte].trailing_ones() as usize;
        (index < self.len).then_some(index)
    }
}

/// Persisted form of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolRecord {
    cidr: IpNet,
    size: usize,
    /// Hex-encoded vector bytes, bit `i` in byte `i / 8`.
    bits: String,
}

impl PoolRecord {
    fn from_bitmap(cidr: IpNet, bitmap: &Bitmap) -> Self {
        Self {
            cidr,
            size: bitmap.len(),
            bits: hex::encode(&bitmap.bytes),
        }
    }

    fn into_bitmap(self, scope: &str) -> Result<Bitmap> {
        let bytes = hex::decode(&self.bits)
            .map_err(|e| Error::Store(format!("corrupt IP pool {}: {}", scope, e)))?;
        if bytes.len() != self.size.div_ceil(8) {
            return Err(Error::PoolMismatch {
                scope: scope.to_string(),
                expected: self.size,
                found: bytes.len() * 8,
            });
        }
        Ok(Bitmap {
            len: self.size,
            bytes,
        })
    }
}

/// Number of addresses in `cidr`.
pub fn address_count(cidr: &IpNet) -> Result<usize> {
    let host_bits = cidr.max_prefix_len() - cidr.prefix_len();
    if host_bits > MAX_HOST_BITS {
        return Err(Error::InvalidCidr(format!(
            "{} (at most {} host bits are supported)",
            cidr, MAX_HOST_BITS
        )));
    }
    Ok(1usize << host_bits)
}

/// `base + offset`, added byte by byte from the least significant end.
pub fn add_offset(base: IpAddr, offset: u64) -> IpAddr {
    fn add(bytes: &mut [u8], offset: u64) {
        let mut carry = offset;
        for byte in bytes.iter_mut().rev() {
            if carry == 0 {
                break;
            }
            let sum = *byte as u64 + (carry & 0xff);
            *byte = sum as u8;
            carry = (carry >> 8) + (sum >> 8);
        }
    }

    match base {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            add(&mut octets, offset);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            add(&mut octets, offset);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

/// Position of `address` inside `cidr`.
pub fn ordinal(cidr: &IpNet, address: IpAddr) -> Result<usize> {
    if !cidr.contains(&address) {
        return Err(Error::InvalidAddress(format!(
            "{} is not within {}",
            address, cidr
        )));
    }
    let offset = match (cidr.network(), address) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => (u32::from(addr) - u32::from(net)) as u128,
        (IpAddr::V6(net), IpAddr::V6(addr)) => u128::from(addr) - u128::from(net),
        _ => unreachable!("contains() rejects mixed families"),
    };
    Ok(offset as usize)
}

#[derive(Debug, Clone)]
pub struct AllocateOptions {
    pub cidr: IpNet,
    /// Reserve exactly this address instead of the lowest free one.
    pub requested: Option<IpAddr>,
}

impl AllocateOptions {
    pub fn new(cidr: IpNet) -> Self {
        Self {
            cidr,
            requested: None,
        }
    }

    pub fn requested(mut self, address: IpAddr) -> Self {
        self.requested = Some(address);
        self
    }
}

/// Bitset IP allocator over the distributed store.
#[derive(Clone)]
pub struct IpAllocator {
    store: Arc<dyn Store>,
    keys: Keys,
}

impl IpAllocator {
    pub fn new(store: Arc<dyn Store>, keys: Keys) -> Self {
        Self { store, keys }
    }

    async fn load(&self, scope: &str, cidr: &IpNet) -> Result<Bitmap> {
        let count = address_count(cidr)?;
        let key = self.keys.ip_pool(scope);
        let bitmap = match store::get_json::<PoolRecord>(&*self.store, &key).await {
            Ok(record) => record.into_bitmap(scope)?,
            Err(e) if e.is_not_found() => {
                debug!("Initialising IP pool {} for {}", scope, cidr);
                let mut bitmap = Bitmap::new(count);
                bitmap.set(0);
                bitmap.set(count - 1);
                bitmap
            }
            Err(e) => return Err(e),
        };
        if bitmap.len() != count {
            return Err(Error::PoolMismatch {
                scope: scope.to_string(),
                expected: count,
                found: bitmap.len(),
            });
        }
        Ok(bitmap)
    }

    async fn save(&self, scope: &str, cidr: IpNet, bitmap: &Bitmap) -> Result<()> {
        let record = PoolRecord::from_bitmap(cidr, bitmap);
        store::put_json(&*self.store, &self.keys.ip_pool(scope), &record).await
    }

    /// Take the lowest free address (or the requested one) from `scope`.
    /// Returns the address with the pool's prefix length.
    pub async fn allocate(&self, scope: &str, opts: &AllocateOptions) -> Result<IpNet> {
        let cidr = opts.cidr.trunc();
        let mut bitmap = self.load(scope, &cidr).await?;

        let index = match opts.requested {
            Some(address) => {
                let index = ordinal(&cidr, address)?;
                if index == 0 || index == bitmap.len() - 1 {
                    return Err(Error::InvalidAddress(format!(
                        "{} is reserved in {}",
                        address, cidr
                    )));
                }
                if bitmap.get(index) {
                    return Err(Error::AlreadyExists(format!(
                        "address {} in pool {}",
                        address, scope
                    )));
                }
                index
            }
            None => bitmap
                .first_clear()
                .ok_or_else(|| Error::PoolExhausted(scope.to_string()))?,
        };

        bitmap.set(index);
        self.save(scope, cidr, &bitmap).await?;

        let address = add_offset(cidr.network(), index as u64);
        let allocated = IpNet::new(address, cidr.prefix_len())
            .map_err(|e| Error::InvalidCidr(e.to_string()))?;
        debug!("Allocated {} from pool {}", allocated, scope);
        Ok(allocated)
    }

    /// Return `address` to `scope`. Releasing a free address is a no-op.
    pub async fn release(&self, scope: &str, address: IpAddr) -> Result<()> {
        let key = self.keys.ip_pool(scope);
        let record: PoolRecord = store::get_json(&*self.store, &key).await?;
        let cidr = record.cidr;
        let mut bitmap = record.into_bitmap(scope)?;
        let count = address_count(&cidr)?;
        if bitmap.len() != count {
            return Err(Error::PoolMismatch {
                scope: scope.to_string(),
                expected: count,
                found: bitmap.len(),
            });
        }

        let index = ordinal(&cidr, address)?;
        if index == 0 || index == bitmap.len() - 1 {
            return Err(Error::InvalidAddress(format!(
                "{} is reserved in {}",
                address, cidr
            )));
        }
        if !bitmap.get(index) {
            return Ok(());
        }
        bitmap.clear(index);
        self.save(scope, cidr, &bitmap).await?;
        debug!("Released {} to pool {}", address, scope);
        Ok(())
    }

    /// Forget the whole pool of `scope`.
    pub async fn release_pool(&self, scope: &str) -> Result<()> {
        store::delete_if_exists(&*self.store, &self.keys.ip_pool(scope)).await
    }
}
