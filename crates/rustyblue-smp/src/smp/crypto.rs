//! Cryptographic toolbox for the Security Manager Protocol
//!
//! Implements the security functions of Bluetooth Core (Vol 3,
//! Part H, 2.2): `e`, `ah`, `c1`, `s1` and `d1` for LE legacy pairing and
//! identity handling, and `f4`, `f5`, `f6`, `g2`, `h6` and `h7` for LE
//! Secure Connections.
//!
//! Every function takes and returns values in wire order (least significant
//! byte first). AES and AES-CMAC operate most significant byte first, so
//! each input is reversed into a local buffer before the primitive runs and
//! the result is reversed back. Caller buffers are never modified.

use super::constants::*;
use super::types::*;
use crate::gap::LeAddress;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use byteorder::{BigEndian, ByteOrder};
use cmac::{Cmac, Mac};
use zeroize::Zeroizing;

fn swap<const N: usize>(src: &[u8; N]) -> [u8; N] {
    let mut out = *src;
    out.reverse();
    out
}

fn swap_address(address: &LeAddress) -> [u8; 6] {
    swap(&address.address.bytes)
}

fn crypto_error(err: impl std::fmt::Display) -> SmpError {
    SmpError::CryptoError(err.to_string())
}

/// AES-CMAC with key and message most significant byte first.
fn aes_cmac(key: &[u8; 16], message: &[u8]) -> SmpResult<[u8; 16]> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(crypto_error)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// Same as [`aes_cmac`] but with the key and result in wire order.
fn aes_cmac_le(key: &[u8; 16], message: &[u8]) -> SmpResult<[u8; 16]> {
    let key_be = Zeroizing::new(swap(key));
    let mut out = aes_cmac(&key_be, message)?;
    out.reverse();
    Ok(out)
}

/// Security function `e`: AES-128 encryption of one block.
pub fn e(key: &[u8; 16], plaintext: &[u8; 16]) -> SmpResult<[u8; 16]> {
    let key_be = Zeroizing::new(swap(key));
    let cipher = Aes128::new_from_slice(key_be.as_slice()).map_err(crypto_error)?;

    let mut block = aes::Block::from(swap(plaintext));
    cipher.encrypt_block(&mut block);

    let mut out: [u8; 16] = block.into();
    out.reverse();
    Ok(out)
}

fn xor_16(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Random address hash function `ah`, used to resolve private addresses.
pub fn ah(irk: &[u8; 16], prand: &[u8; 3]) -> SmpResult<[u8; 3]> {
    let mut r = [0u8; 16];
    r[..3].copy_from_slice(prand);

    let res = e(irk, &r)?;
    Ok([res[0], res[1], res[2]])
}

/// Whether `address` is a resolvable private address generated from `irk`.
pub fn irk_matches(irk: &[u8; 16], address: &LeAddress) -> SmpResult<bool> {
    if !address.is_resolvable_private() {
        return Ok(false);
    }

    let bytes = &address.address.bytes;
    let hash = ah(irk, &[bytes[3], bytes[4], bytes[5]])?;
    Ok(hash == [bytes[0], bytes[1], bytes[2]])
}

/// Legacy confirm value generation function `c1`.
///
/// `preq` and `pres` are the complete Pairing Request and Pairing Response
/// PDUs, opcode included, exactly as they were sent or received.
pub fn c1(
    k: &[u8; 16],
    r: &[u8; 16],
    preq: &[u8; 7],
    pres: &[u8; 7],
    initiator: &LeAddress,
    responder: &LeAddress,
) -> SmpResult<[u8; 16]> {
    // p1 = pres || preq || rat || iat
    let mut p1 = [0u8; 16];
    p1[0] = initiator.type_u8();
    p1[1] = responder.type_u8();
    p1[2..9].copy_from_slice(preq);
    p1[9..16].copy_from_slice(pres);

    // p2 = padding || ia || ra
    let mut p2 = [0u8; 16];
    p2[0..6].copy_from_slice(&responder.address.bytes);
    p2[6..12].copy_from_slice(&initiator.address.bytes);

    let res = e(k, &xor_16(r, &p1))?;
    e(k, &xor_16(&res, &p2))
}

/// Legacy short term key generation function `s1`.
pub fn s1(k: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> SmpResult<[u8; 16]> {
    // r' = r1' || r2', the least significant halves of both nonces
    let mut r = Zeroizing::new([0u8; 16]);
    r[0..8].copy_from_slice(&r2[0..8]);
    r[8..16].copy_from_slice(&r1[0..8]);

    e(k, &r)
}

/// Key diversifying function `d1`.
pub fn d1(k: &[u8; 16], d: u16, r: u16) -> SmpResult<[u8; 16]> {
    let mut d_prime = [0u8; 16];
    d_prime[0..2].copy_from_slice(&d.to_le_bytes());
    d_prime[2..4].copy_from_slice(&r.to_le_bytes());

    e(k, &d_prime)
}

/// Identity resolving key derived from an identity root, `d1(IR, 1, 0)`.
pub fn irk_from_identity_root(ir: &[u8; 16]) -> SmpResult<[u8; 16]> {
    if ir.iter().all(|b| *b == 0) {
        return Err(SmpError::InvalidParameter(
            "identity root is not provisioned".to_string(),
        ));
    }

    d1(ir, 1, 0)
}

/// LE Secure Connections confirm value generation function `f4`.
pub fn f4(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], z: u8) -> SmpResult<[u8; 16]> {
    let mut m = [0u8; 65];
    m[0..32].copy_from_slice(&swap(u));
    m[32..64].copy_from_slice(&swap(v));
    m[64] = z;

    aes_cmac_le(x, &m)
}

/// LE Secure Connections key generation function `f5`.
///
/// Returns `(mac_key, ltk)`.
pub fn f5(
    w: &[u8; 32],
    n1: &[u8; 16],
    n2: &[u8; 16],
    a1: &LeAddress,
    a2: &LeAddress,
) -> SmpResult<([u8; 16], [u8; 16])> {
    let w_be = Zeroizing::new(swap(w));
    let t = Zeroizing::new(aes_cmac(&SMP_F5_SALT, w_be.as_slice())?);

    // counter || keyID || N1 || N2 || A1 || A2 || length
    let mut m = [0u8; 53];
    m[1..5].copy_from_slice(&SMP_F5_KEY_ID);
    m[5..21].copy_from_slice(&swap(n1));
    m[21..37].copy_from_slice(&swap(n2));
    m[37] = a1.type_u8();
    m[38..44].copy_from_slice(&swap_address(a1));
    m[44] = a2.type_u8();
    m[45..51].copy_from_slice(&swap_address(a2));
    m[51..53].copy_from_slice(&SMP_F5_LENGTH);

    let mut mac_key = aes_cmac(&t, &m)?;
    mac_key.reverse();

    m[0] = 0x01;
    let mut ltk = aes_cmac(&t, &m)?;
    ltk.reverse();

    Ok((mac_key, ltk))
}

/// LE Secure Connections check value generation function `f6`.
///
/// `io_cap` holds the IO capability, OOB flag and authentication
/// requirements bytes in the order they appear in the pairing PDU.
pub fn f6(
    w: &[u8; 16],
    n1: &[u8; 16],
    n2: &[u8; 16],
    r: &[u8; 16],
    io_cap: &[u8; 3],
    a1: &LeAddress,
    a2: &LeAddress,
) -> SmpResult<[u8; 16]> {
    let mut m = [0u8; 65];
    m[0..16].copy_from_slice(&swap(n1));
    m[16..32].copy_from_slice(&swap(n2));
    m[32..48].copy_from_slice(&swap(r));
    m[48..51].copy_from_slice(&swap(io_cap));
    m[51] = a1.type_u8();
    m[52..58].copy_from_slice(&swap_address(a1));
    m[58] = a2.type_u8();
    m[59..65].copy_from_slice(&swap_address(a2));

    aes_cmac_le(w, &m)
}

/// LE Secure Connections numeric comparison value generation function `g2`.
pub fn g2(u: &[u8; 32], v: &[u8; 32], x: &[u8; 16], y: &[u8; 16]) -> SmpResult<u32> {
    let mut m = [0u8; 80];
    m[0..32].copy_from_slice(&swap(u));
    m[32..64].copy_from_slice(&swap(v));
    m[64..80].copy_from_slice(&swap(y));

    let res = aes_cmac(&swap(x), &m)?;
    Ok(BigEndian::read_u32(&res[12..16]) % SMP_PASSKEY_MODULUS)
}

/// Link key conversion function `h6`.
pub fn h6(w: &[u8; 16], key_id: &[u8; 4]) -> SmpResult<[u8; 16]> {
    aes_cmac_le(w, &swap(key_id))
}

/// Link key conversion function `h7`.
pub fn h7(salt: &[u8; 16], w: &[u8; 16]) -> SmpResult<[u8; 16]> {
    let w_be = Zeroizing::new(swap(w));
    aes_cmac_le(salt, w_be.as_slice())
}

/// BR/EDR link key derived from an LE Secure Connections LTK.
pub fn link_key_from_ltk(ltk: &[u8; 16], ct2: bool) -> SmpResult<[u8; 16]> {
    let ilk = Zeroizing::new(if ct2 {
        h7(&SMP_SALT_TMP1, ltk)?
    } else {
        h6(ltk, &SMP_KEY_ID_TMP1)?
    });

    h6(&ilk, &SMP_KEY_ID_LEBR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::{AddressType, BdAddr};
    use proptest::prelude::*;

    /// Decode a hex string that is already in wire order.
    fn le<const N: usize>(s: &str) -> [u8; N] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    /// Decode a hex string written most significant byte first.
    fn be<const N: usize>(s: &str) -> [u8; N] {
        let mut out: [u8; N] = le(s);
        out.reverse();
        out
    }

    fn u() -> [u8; 32] {
        le("e69d350e480103ccdbfdf4ac1191f4efb9a5f9e9a7832c5e2cbe97f2d203b020")
    }

    fn v() -> [u8; 32] {
        le("fdc57ff449dd4f6bfb7c9df1c29acb592ae7d4eefbfc0a909abbf6323d8b1855")
    }

    fn n1() -> [u8; 16] {
        le("abae2b71ecb2ffff3e7377d15484cbd5")
    }

    fn n2() -> [u8; 16] {
        le("cfc43dfff78365216e5fa725cce7e8a6")
    }

    fn a1() -> LeAddress {
        LeAddress::new(AddressType::Public, BdAddr::new(le("cebf37371256")))
    }

    fn a2() -> LeAddress {
        LeAddress::new(AddressType::Public, BdAddr::new(le("c1cf2d7013a7")))
    }

    fn c1_inputs() -> ([u8; 16], [u8; 7], [u8; 7], LeAddress, LeAddress) {
        (
            be("5783D52156AD6F0E6388274EC6702EE0"),
            be("07071000000101"),
            be("05000800000302"),
            LeAddress::new(AddressType::Random, BdAddr::new(be("A1A2A3A4A5A6"))),
            LeAddress::new(AddressType::Public, BdAddr::new(be("B1B2B3B4B5B6"))),
        )
    }

    #[test]
    fn test_c1() {
        let (r, preq, pres, ia, ra) = c1_inputs();
        let res = c1(&[0; 16], &r, &preq, &pres, &ia, &ra).unwrap();
        assert_eq!(res, be::<16>("1e1e3fef878988ead2a74dc5bef13b86"));
    }

    #[test]
    fn test_c1_leaves_inputs_untouched() {
        let (r, preq, pres, ia, ra) = c1_inputs();
        let (r_copy, preq_copy) = (r, preq);
        c1(&[0; 16], &r, &preq, &pres, &ia, &ra).unwrap();
        assert_eq!(r, r_copy);
        assert_eq!(preq, preq_copy);
    }

    #[test]
    fn test_s1() {
        let r1 = be("000F0E0D0C0B0A091122334455667788");
        let r2 = be("010203040506070899AABBCCDDEEFF00");
        let res = s1(&[0; 16], &r1, &r2).unwrap();
        assert_eq!(res, be::<16>("9a1fe1f0e8b0f49b5b4216ae796da062"));
    }

    #[test]
    fn test_d1_matches_e_of_diversifier() {
        let k: [u8; 16] = le("000102030405060708090a0b0c0d0e0f");
        let mut plain = [0u8; 16];
        plain[0] = 0x01;
        assert_eq!(d1(&k, 1, 0).unwrap(), e(&k, &plain).unwrap());
        assert_ne!(d1(&k, 1, 0).unwrap(), d1(&k, 1, 1).unwrap());
    }

    #[test]
    fn test_irk_requires_identity_root() {
        assert!(irk_from_identity_root(&[0; 16]).is_err());
        assert!(irk_from_identity_root(&[1; 16]).is_ok());
    }

    #[test]
    fn test_ah() {
        let irk = be("ec0234a357c8ad05341010a60a397d9b");
        let hash = ah(&irk, &be("708194")).unwrap();
        assert_eq!(hash, be::<3>("0dfbaa"));
    }

    #[test]
    fn test_irk_matches_resolvable_address() {
        let irk = be("ec0234a357c8ad05341010a60a397d9b");
        let rpa = LeAddress::random(be("7081940dfbaa"));
        assert!(irk_matches(&irk, &rpa).unwrap());

        let other = LeAddress::random(be("7081940dfbab"));
        assert!(!irk_matches(&irk, &other).unwrap());
    }

    #[test]
    fn test_f4() {
        let res = f4(&u(), &v(), &n1(), 0).unwrap();
        assert_eq!(res, le::<16>("2d8774a9bea1edf11cbda907f116c9f2"));
    }

    #[test]
    fn test_f5() {
        let w = le("98a6bf73f3348d86f166f8b4136b79999b7d390aa610103405adc857a33402ec");
        let (mac_key, ltk) = f5(&w, &n1(), &n2(), &a1(), &a2()).unwrap();
        assert_eq!(mac_key, le::<16>("206e63ce206a3ffd024a08a176f16529"));
        assert_eq!(ltk, le::<16>("380a7594b522059823cdd76911798669"));
    }

    #[test]
    fn test_f6() {
        let mac_key = le("206e63ce206a3ffd024a08a176f16529");
        let r = le("c80f2d0cd242da0854bb53b43b34a312");
        let res = f6(&mac_key, &n1(), &n2(), &r, &[0x02, 0x01, 0x01], &a1(), &a2()).unwrap();
        assert_eq!(res, le::<16>("618f95da090b6cd2c5e8d09c9873c4e3"));
    }

    #[test]
    fn test_g2() {
        let passkey = g2(&u(), &v(), &n1(), &n2()).unwrap();
        assert_eq!(passkey, 0x2f9ed5ba % 1_000_000);
    }

    #[test]
    fn test_h6() {
        let w = le("9b7d390aa610103405adc857a33402ec");
        let res = h6(&w, &SMP_KEY_ID_LEBR).unwrap();
        assert_eq!(res, le::<16>("9963b180e2a9d3e81cc96de702e19a2d"));
    }

    #[test]
    fn test_h7() {
        let w = le("9b7d390aa610103405adc857a33402ec");
        let res = h7(&SMP_SALT_TMP1, &w).unwrap();
        assert_eq!(res, le::<16>("1170a5752a8c99d2ecc0a3c6973517fb"));
    }

    #[test]
    fn test_link_key_depends_on_ct2() {
        let ltk = le("9b7d390aa610103405adc857a33402ec");
        let with_ct2 = link_key_from_ltk(&ltk, true).unwrap();
        let without = link_key_from_ltk(&ltk, false).unwrap();
        assert_ne!(with_ct2, without);

        let ilk = h7(&SMP_SALT_TMP1, &ltk).unwrap();
        assert_eq!(with_ct2, h6(&ilk, &SMP_KEY_ID_LEBR).unwrap());
    }

    proptest! {
        #[test]
        fn prop_c1_changes_with_any_input_byte(
            k in any::<[u8; 16]>(),
            r in any::<[u8; 16]>(),
            preq in any::<[u8; 7]>(),
            pres in any::<[u8; 7]>(),
            ia in any::<[u8; 6]>(),
            ra in any::<[u8; 6]>(),
            index in 0usize..48,
            flip in 1u8..=255,
        ) {
            let initiator = LeAddress::random(ia);
            let responder = LeAddress::public(ra);
            let base = c1(&k, &r, &preq, &pres, &initiator, &responder).unwrap();

            let (mut r2, mut preq2, mut pres2, mut ia2, mut ra2) = (r, preq, pres, ia, ra);
            match index {
                0..=15 => r2[index] ^= flip,
                16..=22 => preq2[index - 16] ^= flip,
                23..=29 => pres2[index - 23] ^= flip,
                30..=35 => ia2[index - 30] ^= flip,
                36..=41 => ra2[index - 36] ^= flip,
                _ => {
                    let mut k2 = k;
                    k2[index - 42] ^= flip;
                    let res = c1(&k2, &r, &preq, &pres, &initiator, &responder).unwrap();
                    prop_assert_ne!(res, base);
                    return Ok(());
                }
            }

            let res = c1(
                &k,
                &r2,
                &preq2,
                &pres2,
                &LeAddress::random(ia2),
                &LeAddress::public(ra2),
            )
            .unwrap();
            prop_assert_ne!(res, base);
        }

        #[test]
        fn prop_g2_is_six_digits(
            u in any::<[u8; 32]>(),
            v in any::<[u8; 32]>(),
            x in any::<[u8; 16]>(),
            y in any::<[u8; 16]>(),
        ) {
            prop_assert!(g2(&u, &v, &x, &y).unwrap() <= SMP_PASSKEY_MAX);
        }
    }
}
