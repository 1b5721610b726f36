//! Conversion of threshold signatures into the on-chain format.

use crate::chain::Signature;
use crate::error::{KeepError, KeepResult};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::AffineCoordinates;
use k256::{AffinePoint, FieldBytes, Scalar, U256};
use keep_primitives::Digest;

/// The digest as the scalar the signing protocol signs.
pub fn digest_scalar(digest: &Digest) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::clone_from_slice(digest.as_bytes()))
}

/// Builds the chain signature from the protocol output `(R, s)`.
pub fn to_chain_signature(
    big_r: &AffinePoint,
    s: &Scalar,
    public_key: &AffinePoint,
    digest: &Digest,
) -> KeepResult<Signature> {
    let r = <Scalar as Reduce<U256>>::reduce_bytes(&big_r.x());
    let signature = EcdsaSignature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|_| KeepError::Crypto("signature has a zero component".to_string()))?;
    with_recovery_id(signature, public_key, digest)
}

/// Normalizes `signature` to low S and finds the recovery id under which it
/// recovers `public_key`. Only the two ids without x reduction are tried.
pub fn with_recovery_id(
    signature: EcdsaSignature,
    public_key: &AffinePoint,
    digest: &Digest,
) -> KeepResult<Signature> {
    let signature = signature.normalize_s().unwrap_or(signature);
    let expected = VerifyingKey::from_affine(*public_key)
        .map_err(|_| KeepError::Crypto("keep public key is the identity".to_string()))?;
    for is_y_odd in [false, true] {
        let recovery_id = RecoveryId::new(is_y_odd, false);
        let Ok(recovered) =
            VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recovery_id)
        else {
            continue;
        };
        if recovered == expected {
            let bytes = signature.to_bytes();
            let mut r = [0u8; 32];
            let mut s = [0u8; 32];
            r.copy_from_slice(&bytes[..32]);
            s.copy_from_slice(&bytes[32..]);
            return Ok(Signature {
                r,
                s,
                recovery_id: recovery_id.to_byte(),
            });
        }
    }
    Err(KeepError::Crypto(format!(
        "no recovery id recovers the keep public key for digest {}",
        digest
    )))
}
