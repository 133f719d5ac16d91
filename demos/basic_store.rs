use hdkeystore::{
    ExtendedKey, HDChain, HDKeyStore, KeyPath, MasterSeed, NullKeyStore, PassphraseCipher,
};
use secp256k1::{PublicKey, Secp256k1};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("HD Key Store Demo");
    println!("=================");

    // Seed entropy would normally come from a mnemonic or an RNG; the
    // BIP32 test-vector seed keeps the output reproducible.
    let seed = hex::decode("000102030405060708090a0b0c0d0e0f")?;
    let master = ExtendedKey::from_seed(&seed)?;
    let chain_id = master.neuter().chain_id();

    let store = HDKeyStore::new(NullKeyStore, PassphraseCipher::new());
    store.add_master_seed(chain_id, MasterSeed::new(seed))?;

    // A BIP44-style chain with public roots for both subtrees, so
    // address generation runs on public CKD alone.
    let mut chain = HDChain::new(chain_id, "m/44'/0'/0'/c", 0);
    let external_path = KeyPath::from_str("m/44'/0'/0'/0")?;
    let internal_path = KeyPath::from_str("m/44'/0'/0'/1")?;
    chain.external_pubkey = Some(
        master
            .derive_indices(&external_path.derivation_indices()?)?
            .neuter(),
    );
    chain.internal_pubkey = Some(
        master
            .derive_indices(&internal_path.derivation_indices()?)?
            .neuter(),
    );
    chain.use_pub_ckd = true;
    store.add_chain(chain);

    println!("\nReceive addresses:");
    for _ in 0..3 {
        let index = store.get_next_child_index(&chain_id, false);
        let entry = store.derive_hd_pubkey_at_index(&chain_id, index, false)?;
        println!(
            "  {}  {}",
            entry.keypath,
            hex::encode(entry.pubkey.serialize())
        );
        store.load_hd_pubkey(entry);
    }

    let change = store.derive_hd_pubkey_at_index(&chain_id, 0, true)?;
    println!("\nChange address:");
    println!(
        "  {}  {}",
        change.keypath,
        hex::encode(change.pubkey.serialize())
    );
    store.load_hd_pubkey(change.clone());

    // Private material is re-derived from the seed on demand.
    let secret = store.get_key(&change.key_id())?;
    let recovered = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
    assert_eq!(recovered, change.pubkey);
    println!("\nRecovered the private key for {}", change.keypath);

    // One-way transition to encrypted seeds.
    store.cipher().enable("correct horse battery staple");
    store.encrypt_seeds()?;
    store.cipher().lock();
    assert!(store.get_key(&change.key_id()).is_err());
    println!("Seed vault encrypted; private keys unavailable while locked.");

    store.cipher().unlock("correct horse battery staple");
    assert!(store.get_key(&change.key_id()).is_ok());
    println!("Unlocked; private keys recoverable again.");

    Ok(())
}
