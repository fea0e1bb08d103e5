use crate::vault::keys::generate_master_key;

pub fn handle_gen_key() {
    let key = generate_master_key();
    println!("{}", key);
    eprintln!("Store it in CUSTODIAN_ENCRYPTION_KEY (or the env var named by [vault] master_key_env).");
    eprintln!("Losing this key makes every stored session unreadable.");
}
