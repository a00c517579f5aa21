//! erpvau CLI — VAU transport, HSM pool and VSDM proof tooling
//!
//! Commands:
//!   erpvau hcv                compute a health card value
//!   erpvau vsdm-encode        build a signed (v1) or encrypted (v2) proof
//!   erpvau vsdm-decode        decode and optionally validate a proof
//!   erpvau envelope-inspect   show the fields of an outer VAU request
//!   erpvau config             print the effective configuration
//!   erpvau health             start a pool and print its health report
//!   erpvau demo               end-to-end request through the simulated HSM

use chrono::{DateTime, Utc};
use erp_vau_core::hsm::MockHsmClient;
use erp_vau_core::tee::{ClientTeeProtocol, InnerResponse, OuterEnvelope, TeeProtocol};
use erp_vau_core::vsdm::{
    make_hcv, DecryptedProof, ProofValidator, VsdmKey, VsdmKeyRing, VsdmProof, VsdmProofV1,
    VsdmProofV2,
};
use erp_vau_core::{HttpStatus, Result, VauConfig, VauContext, VauError};
use std::env;
use std::path::Path;
use tokio::runtime::Handle;

fn print_usage() {
    println!(
        r#"
ERP VAU core tools

Usage: erpvau <command> [options]

Commands:
  hcv              <insurance-start> <street>                         Compute a health card value
  vsdm-encode      <v1|v2> <operator> <version> <key-b64> <kvnr> [revoked] [start street]
                                                                      Build a proof for now
  vsdm-decode      <proof> [<key-b64>]                                Decode, and validate with a key
  envelope-inspect <hex-file>                                         Show outer request fields
  config           [config.json]                                      Print effective configuration
  health           [config.json]                                      Start a pool, print health JSON
  demo                                                                Run an end-to-end demo

Environment:
  ERP_HSM_BACKEND, ERP_HSM_MAX_SESSION_COUNT, ERP_HSM_IDLE_TIMEOUT_SECONDS,
  ERP_HSM_ACQUIRE_TIMEOUT_SECONDS, ERP_HSM_DEVICE, ERP_TEE_TOKEN_UPDATE_SECONDS,
  ERP_TEE_TOKEN_RETRY_SECONDS, ERP_PROOF_VALIDITY_SECONDS

Examples:
  erpvau hcv 20250101 "Friedrichstrasse 136"
  erpvau vsdm-encode v2 A 0 c2VjcmV0LWtleS1mb3Itdi0y X110506918
  erpvau demo
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let rest = args[2..].to_vec();
    let handle = Handle::current();
    let result = match args[1].as_str() {
        "hcv" => cmd_hcv(&rest),
        "vsdm-encode" => cmd_vsdm_encode(&rest),
        "vsdm-decode" => cmd_vsdm_decode(&rest),
        "envelope-inspect" => cmd_envelope_inspect(&rest),
        "config" => cmd_config(&rest),
        "health" => run_blocking(move || cmd_health(&rest, &handle)).await,
        "demo" => run_blocking(move || cmd_demo(&handle)).await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

/// Pool operations block; keep them off the async workers
async fn run_blocking(f: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VauError::Internal(format!("command task failed: {}", e)))?
}

fn usage(text: &str) -> Result<()> {
    eprintln!("Usage: {}", text);
    Ok(())
}

fn single_char(value: &str, what: &str) -> Result<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(VauError::Config(format!("{} must be a single character", what))),
    }
}

fn cmd_hcv(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        return usage("erpvau hcv <insurance-start> <street>");
    }
    let hcv = make_hcv(&args[0], &args[1]);
    println!("\n  HCV: {}", hex::encode(hcv));
    Ok(())
}

fn cmd_vsdm_encode(args: &[String]) -> Result<()> {
    if args.len() < 5 {
        return usage(
            "erpvau vsdm-encode <v1|v2> <operator> <version> <key-b64> <kvnr> [revoked] [start street]",
        );
    }
    let key = VsdmKey::from_base64(
        single_char(&args[1], "operator")?,
        single_char(&args[2], "version")?,
        &args[3],
    )?;
    let kvnr = &args[4];
    let now = Utc::now();

    let encoded = match args[0].as_str() {
        "v1" => VsdmProofV1::sign(&key, kvnr, now, b'U')?.serialize(),
        "v2" => {
            let revoked = args.get(5).is_some_and(|a| a == "revoked");
            let hcv = match (args.get(6), args.get(7)) {
                (Some(start), Some(street)) => make_hcv(start, street),
                _ => [0u8; 5],
            };
            let proof = DecryptedProof {
                revoked,
                hcv,
                iat: now,
                kvnr: kvnr.clone(),
            };
            VsdmProofV2::encrypt(&key, &proof)?.serialize()
        }
        other => {
            return Err(VauError::Config(format!("unknown proof version '{}'", other)));
        }
    };
    println!("\n  Proof: {}", encoded);
    Ok(())
}

fn cmd_vsdm_decode(args: &[String]) -> Result<()> {
    if args.is_empty() {
        return usage("erpvau vsdm-decode <proof> [<key-b64>]");
    }
    let proof = VsdmProof::from_base64(&args[0])?;
    println!("\n  Operator:  {}", proof.key_operator_id());
    println!("  Version:   {}", proof.key_version());

    match &proof {
        VsdmProof::V1(p) => {
            println!("  Format:    v1 (HMAC)");
            println!("  KVNR:      {}", p.kvnr()?);
            println!("  Timestamp: {}", p.timestamp()?.to_rfc3339());
        }
        VsdmProof::V2(_) => println!("  Format:    v2 (AES-GCM)"),
    }

    let Some(secret) = args.get(1) else {
        return Ok(());
    };
    let key = VsdmKey::from_base64(proof.key_operator_id(), proof.key_version(), secret)?;
    if let VsdmProof::V2(p) = &proof {
        let decrypted = p.decrypt(key.secret())?;
        println!("  KVNR:      {}", decrypted.kvnr);
        println!("  Issued:    {}", decrypted.iat.to_rfc3339());
        println!("  Revoked:   {}", decrypted.revoked);
        println!("  HCV:       {}", hex::encode(decrypted.hcv));
    }

    let config = VauConfig::load(None)?;
    let mut keys = VsdmKeyRing::new();
    keys.insert(key);
    let validator = ProofValidator::new(config.proof_validity())?;
    match validator.validate(&args[0], &keys, None, Utc::now()) {
        Ok(valid) => println!("  Valid:     yes (issued {})", valid.timestamp.to_rfc3339()),
        Err(e) => println!("  Valid:     no ({})", e),
    }
    Ok(())
}

fn cmd_envelope_inspect(args: &[String]) -> Result<()> {
    if args.is_empty() {
        return usage("erpvau envelope-inspect <hex-file>");
    }
    let text = std::fs::read_to_string(&args[0])
        .map_err(|e| VauError::Config(format!("can't read {}: {}", args[0], e)))?;
    let data = hex::decode(text.trim())
        .map_err(|_| VauError::Format(format!("{} does not contain hex data", args[0])))?;
    let envelope = OuterEnvelope::disassemble(&data)?;

    println!("\n  Size:       {} bytes", data.len());
    println!("  Version:    {}", envelope.version);
    println!("  X:          {}", hex::encode(envelope.x_component));
    println!("  Y:          {}", hex::encode(envelope.y_component));
    println!("  IV:         {}", hex::encode(envelope.iv));
    println!("  Ciphertext: {} bytes", envelope.ciphertext.len());
    println!("  Tag:        {}", hex::encode(envelope.authentication_tag));
    Ok(())
}

fn cmd_config(args: &[String]) -> Result<()> {
    let config = VauConfig::load(args.first().map(Path::new))?;
    println!("\n{}", config.summary());
    Ok(())
}

fn cmd_health(args: &[String], handle: &Handle) -> Result<()> {
    let config = VauConfig::load(args.first().map(Path::new))?;
    let ctx = VauContext::new(config, handle)?;
    println!("{}", ctx.health().to_json()?);
    ctx.shutdown()
}

fn cmd_demo(handle: &Handle) -> Result<()> {
    println!("\n  == VAU round trip through the simulated HSM ==");
    let mut ctx = VauContext::new(VauConfig::load(None)?, handle)?;

    let latest = ctx.pool().factory().keys().keys().latest;
    let server_key = MockHsmClient::public_key_of(&latest)?;
    println!("  VAU public key: {}", hex::encode(&server_key));
    let client = ClientTeeProtocol::new(&server_key)?;

    let http = b"GET /Task HTTP/1.1\r\nHost: erp.example\r\n\r\n";
    let (outer, request_id, response_key) = client.create_request("demo.jwt.token", http)?;
    println!("  Request:  {} bytes, id {}", outer.len(), hex::encode(&request_id));

    let outer_response = ctx.handle_request(&outer, |request| {
        println!("  Decrypted: {}", request.request_line().unwrap_or("<no request line>"));
        InnerResponse::new(HttpStatus::Ok)
            .with_header("Content-Type", "application/fhir+json")
            .with_body(br#"{"resourceType":"Bundle","total":0}"#.to_vec())
    });
    println!(
        "  Response: {} {}, {} bytes",
        outer_response.status,
        outer_response.content_type,
        outer_response.body.len()
    );

    let (answered, decrypted) =
        ClientTeeProtocol::parse_response(&outer_response.body, &response_key)?;
    println!(
        "  Client got: {} for id {}, body {}",
        decrypted.status,
        hex::encode(answered),
        String::from_utf8_lossy(&decrypted.body)
    );

    println!("\n  == Key rotation ==");
    ctx.pool()
        .factory()
        .keys()
        .rotate(MockHsmClient::generate_ecies_key_pair(latest.generation + 1)?);
    let (outer, _, _) = client.create_request("demo.jwt.token", http)?;
    let request = TeeProtocol::decrypt_request(&outer, ctx.pool())?;
    println!("  Old-key request still accepted: {}", hex::encode(request.request_id()));

    let (mut tampered, _, _) = client.create_request("demo.jwt.token", http)?;
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    let rejected = ctx.handle_request(&tampered, |_| InnerResponse::new(HttpStatus::Ok));
    println!("  Tampered request answered with: {}", rejected.status);

    println!("\n  == VSDM proof ==");
    let key = VsdmKey::new('A', '0', b"demo vsdm key material, 32 byte".to_vec())?;
    let hcv = make_hcv("20250101", "Friedrichstrasse 136");
    let proof = VsdmProofV2::encrypt(
        &key,
        &DecryptedProof {
            revoked: false,
            hcv,
            iat: Utc::now(),
            kvnr: "X110506918".into(),
        },
    )?
    .serialize();
    println!("  Proof: {}", proof);
    ctx.register_vsdm_key(key);
    let validated = ctx.validate_proof(&proof, Some(&hcv), Utc::now())?;
    println!("  Valid for {} at {}", validated.kvnr, format_time(validated.timestamp));

    println!("\n  == Health ==");
    println!("{}", ctx.health().to_json()?);

    ctx.shutdown()
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
