//! Bot keypair: event signing, verification, and the DM envelope.
//!
//! The envelope derives a conversation key from a secp256k1 ECDH shared
//! secret and seals the plaintext with XChaCha20-Poly1305. The payload on
//! the wire is `base64(nonce ‖ ciphertext)` with a 24-byte random nonce.
//! Both directions of a conversation derive the same key, so one signer
//! decrypts what the peer's signer encrypted.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bech32::FromBase32;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use secp256k1::ecdh::shared_secret_point;
use secp256k1::{schnorr::Signature, All, Keypair, Message, PublicKey, Secp256k1, XOnlyPublicKey};

use crate::event::{event_hash, unix_now, Event, Tag};

/// Nonce length for the XChaCha20-Poly1305 envelope.
const NONCE_LEN: usize = 24;

/// Holder of the bot's secret key.
pub struct Signer {
    secp: Secp256k1<All>,
    keypair: Keypair,
    pubkey: String,
}

impl Signer {
    /// Build a signer from a hex secret key or an `nsec1…` bech32 string.
    pub fn from_key(key: &str) -> Result<Self> {
        let bytes = if key.starts_with("nsec1") {
            let (hrp, data, _variant) =
                bech32::decode(key).context("decoding bech32 secret key")?;
            if hrp != "nsec" {
                bail!("expected nsec prefix, got {hrp}");
            }
            Vec::<u8>::from_base32(&data).context("converting bech32 payload")?
        } else {
            hex::decode(key).context("decoding hex secret key")?
        };
        if bytes.len() != 32 {
            bail!("secret key must be 32 bytes, got {}", bytes.len());
        }
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &bytes)?;
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Self {
            secp,
            keypair,
            pubkey,
        })
    }

    /// The bot's x-only public key as hex.
    pub fn public_key(&self) -> &str {
        &self.pubkey
    }

    /// Build and sign an event authored by the bot at the current time.
    pub fn sign(&self, kind: u32, tags: Vec<Tag>, content: String) -> Result<Event> {
        let mut ev = Event {
            id: String::new(),
            pubkey: self.pubkey.clone(),
            kind,
            created_at: unix_now(),
            tags,
            content,
            sig: String::new(),
        };
        let hash = event_hash(&ev)?;
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash)?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        ev.sig = hex::encode(sig.as_ref());
        Ok(ev)
    }

    /// Verify an event's id and Schnorr signature.
    pub fn verify(&self, ev: &Event) -> Result<()> {
        let hash = event_hash(ev)?;
        if hex::encode(hash) != ev.id {
            bail!("id mismatch");
        }
        let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
        let msg = Message::from_digest_slice(&hash)?;
        self.secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }

    /// ECDH conversation key against the peer's x-only public key (hex).
    ///
    /// Only the x-coordinate of the shared point feeds the key: the
    /// even-Y lift of an x-only key may be the negation of the true
    /// point, and a point and its negation share an x-coordinate, so
    /// both directions of a conversation agree regardless of either
    /// key's parity.
    fn conversation_key(&self, peer: &str) -> Result<[u8; 32]> {
        let raw = hex::decode(peer).context("decoding peer public key")?;
        if raw.len() != 32 {
            bail!("peer public key must be 32 bytes, got {}", raw.len());
        }
        // x-only keys lift to the even-Y point.
        let mut full = [0u8; 33];
        full[0] = 0x02;
        full[1..].copy_from_slice(&raw);
        let pk = PublicKey::from_slice(&full)?;
        let point = shared_secret_point(&pk, &self.keypair.secret_key());
        let mut key = [0u8; 32];
        key.copy_from_slice(&point[..32]);
        Ok(key)
    }

    /// Encrypt a DM payload for the peer.
    pub fn encrypt(&self, peer: &str, plaintext: &str) -> Result<String> {
        let key = self.conversation_key(peer)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| anyhow!("envelope encryption failed: {e}"))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    /// Decrypt a DM payload from the peer.
    pub fn decrypt(&self, peer: &str, payload: &str) -> Result<String> {
        let data = BASE64.decode(payload).context("decoding envelope")?;
        if data.len() <= NONCE_LEN {
            bail!("envelope too short");
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let key = self.conversation_key(peer)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow!("envelope decryption failed: {e}"))?;
        String::from_utf8(plaintext).context("envelope is not utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::kind;

    fn signer(seed: u8) -> Signer {
        Signer::from_key(&hex::encode([seed; 32])).unwrap()
    }

    #[test]
    fn from_hex_key() {
        let s = signer(1);
        assert_eq!(s.public_key().len(), 64);
    }

    #[test]
    fn rejects_short_key() {
        assert!(Signer::from_key("abcd").is_err());
        assert!(Signer::from_key("not hex at all").is_err());
    }

    #[test]
    fn sign_produces_verifiable_event() {
        let s = signer(1);
        let ev = s
            .sign(kind::PUBLIC_POST, vec![Tag::new(["p", "aa"])], "hello".into())
            .unwrap();
        assert_eq!(ev.pubkey, s.public_key());
        assert_eq!(ev.id.len(), 64);
        s.verify(&ev).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_content() {
        let s = signer(1);
        let mut ev = s.sign(kind::PUBLIC_POST, vec![], "hello".into()).unwrap();
        ev.content = "tampered".into();
        assert!(s.verify(&ev).is_err());
    }

    #[test]
    fn envelope_round_trip_between_two_signers() {
        let bot = signer(1);
        let user = signer(2);
        let sealed = user.encrypt(bot.public_key(), "Hello").unwrap();
        let opened = bot.decrypt(user.public_key(), &sealed).unwrap();
        assert_eq!(opened, "Hello");
    }

    /// Seeds grouped by the Y-parity of their x-only public key.
    fn seeds_by_parity() -> (Vec<u8>, Vec<u8>) {
        let secp = Secp256k1::new();
        let mut even = Vec::new();
        let mut odd = Vec::new();
        for seed in 1u8..=60 {
            let kp = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
            match kp.x_only_public_key().1 {
                secp256k1::Parity::Even => even.push(seed),
                secp256k1::Parity::Odd => odd.push(seed),
            }
            if even.len() >= 2 && odd.len() >= 2 {
                break;
            }
        }
        assert!(even.len() >= 2 && odd.len() >= 2, "parity sample too small");
        (even, odd)
    }

    #[test]
    fn envelope_symmetry_holds_for_every_parity_combination() {
        let (even, odd) = seeds_by_parity();
        let pairs = [
            (even[0], even[1]),
            (even[0], odd[0]),
            (odd[0], even[0]),
            (odd[0], odd[1]),
        ];
        for (a, b) in pairs {
            let alice = signer(a);
            let bob = signer(b);
            let sealed = alice.encrypt(bob.public_key(), "parity check").unwrap();
            let opened = bob.decrypt(alice.public_key(), &sealed).unwrap();
            assert_eq!(opened, "parity check", "seeds {a}/{b}");
        }
    }

    #[test]
    fn envelope_round_trip_over_many_key_pairs() {
        for a in 1u8..=6 {
            for b in 7u8..=12 {
                let alice = signer(a);
                let bob = signer(b);
                let sealed = alice.encrypt(bob.public_key(), "sweep").unwrap();
                let opened = bob.decrypt(alice.public_key(), &sealed).unwrap();
                assert_eq!(opened, "sweep", "seeds {a}/{b}");
            }
        }
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let bot = signer(1);
        let user = signer(2);
        assert!(bot.decrypt(user.public_key(), "not base64 !!").is_err());
        assert!(bot.decrypt(user.public_key(), &BASE64.encode(b"short")).is_err());
        let sealed = user.encrypt(bot.public_key(), "Hello").unwrap();
        // wrong peer key cannot open it
        let other = signer(3);
        assert!(bot.decrypt(other.public_key(), &sealed).is_err());
    }

    #[test]
    fn nsec_and_hex_agree() {
        use bech32::ToBase32;
        let raw = [7u8; 32];
        let nsec = bech32::encode("nsec", raw.to_base32(), bech32::Variant::Bech32).unwrap();
        let a = Signer::from_key(&nsec).unwrap();
        let b = Signer::from_key(&hex::encode(raw)).unwrap();
        assert_eq!(a.public_key(), b.public_key());
    }
}
