use rand;
use std::fmt;

use ADDRESS_LENGTH;
use error::{Error, Result};

#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Serialize, Deserialize, Default, Copy)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let hex_vec: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", hex_vec.join(""))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let hex_vec: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", hex_vec.join(""))
    }
}

impl Address {
    pub fn new(data: [u8; ADDRESS_LENGTH]) -> Self {
        Address(data)
    }

    pub fn rand() -> Self {
        let mut ret = Address([0; ADDRESS_LENGTH]);
        for byte in &mut ret.0 {
            *byte = rand::random::<u8>();
        }
        ret
    }

    pub fn from_hex(hex: &str) -> Result<Address> {
        if !hex.is_ascii() || hex.len() != ADDRESS_LENGTH * 2 {
            return Err(Error::Decode(format!(
                "an address is {} hex digits: {:?}",
                ADDRESS_LENGTH * 2,
                hex,
            )));
        }
        let mut ret = Address([0; ADDRESS_LENGTH]);
        for (i, byte) in ret.0.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| Error::Decode(format!("invalid hex digit in {:?}", hex)))?;
        }
        Ok(ret)
    }

    pub fn xor(&self, other: &Address) -> Address {
        let mut ret = [0; ADDRESS_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Address(ret)
    }

    pub fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for i in 0..ADDRESS_LENGTH {
            if self.0[i] == 0 {
                ret += 8
            } else {
                return ret + self.0[i].leading_zeros() as usize;
            }
        }
        ret
    }

    /// The number of leading bits on which both addresses agree. Identical
    /// addresses agree on all bits.
    pub fn same_prefix_length(&self, other: &Address) -> usize {
        self.xor(other).leading_zeros()
    }
}

/// Returns true if, and only if, `x` is strictly closer to `target` than `y`
/// in XOR space.
pub fn closer(x: &Address, y: &Address, target: &Address) -> bool {
    x.xor(target) < y.xor(target)
}
