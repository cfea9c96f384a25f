use blindvote::*;

pub fn command_keygen(matches: &clap::ArgMatches) {
    let bits: usize = match matches.value_of("bits").unwrap_or("2048").parse() {
        Ok(bits) => bits,
        Err(e) => crate::exit_with("keygen", format!("invalid --bits: {}", e)),
    };

    let (authority, secret) = match Authority::new(bits) {
        Ok(generated) => generated,
        Err(e) => crate::exit_with("keygen", e),
    };

    let public = match authority.public_key_der() {
        Ok(der) => der,
        Err(e) => crate::exit_with("keygen", e),
    };
    let secret = match secret.to_der() {
        Ok(der) => der,
        Err(e) => crate::exit_with("keygen", e),
    };

    println!("authority-id: {}", authority.id);
    println!("secret-key: {}", base64::encode(&secret));
    println!("public-key: {}", base64::encode(&public));
}
