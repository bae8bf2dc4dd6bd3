use bitcoin::hashes::Hash as _;
use nodeview::hash::{decode_hash, encode_hash};
use nodeview::prelude::*; // Executor, Chain, completion, PaymentAddress, ...
use nodeview::{address::MAINNET_P2KH, ExecutorState, List};
use std::io::Write;

const REGTEST_GENESIS: &str = "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";

#[cfg(feature = "store-sqlite")]
#[test]
fn executor_from_config_file_serves_genesis() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nodeview.toml");
    let mut file = std::fs::File::create(&path)?;
    writeln!(
        file,
        "network = \"regtest\"\n[store]\ndirectory = {:?}\n[runtime]\nworker_threads = 1",
        dir.path().join("store")
    )?;

    let executor = Executor::new(&path)?;
    executor.init_chain()?;
    executor.run()?;
    let chain: Chain = executor.chain();

    let (handler, height) = completion::channel();
    chain.fetch_last_height(handler);
    assert_eq!(height.wait()?, 0);

    let (handler, block) = completion::channel();
    chain.fetch_block_by_height(0, handler);
    let block: Block = block.wait()?;
    assert_eq!(encode_hash(&block.hash().to_byte_array()), REGTEST_GENESIS);
    assert_eq!(block.header().height(), Some(0));

    executor.stop()?;
    assert_eq!(executor.state(), ExecutorState::Stopped);
    assert!(dir.path().join("store").join("chain.sqlite").exists());
    Ok(())
}

#[test]
fn hash_text_is_byte_reversed() -> anyhow::Result<()> {
    let bytes = decode_hash(REGTEST_GENESIS)?;
    assert_eq!(bytes[31], 0x0f);
    assert_eq!(encode_hash(&bytes), REGTEST_GENESIS);
    assert_eq!(
        bitcoin::BlockHash::from_byte_array(bytes).to_string(),
        REGTEST_GENESIS
    );
    assert!(decode_hash("00").is_err());
    Ok(())
}

#[test]
fn payment_addresses_round_trip() -> anyhow::Result<()> {
    let text = "1BoatSLRHtKNngkdXEeobR76b53LETtpyT";
    let address: PaymentAddress = text.parse()?;
    assert_eq!(address.version(), MAINNET_P2KH);
    assert_eq!(address.encoded(), text);
    assert_eq!(PaymentAddress::new(address.version(), *address.hash())?, address);

    let broken = "1BoatSLRHtKNngkdXEeobR76b53LETtpyU";
    let err = broken.parse::<PaymentAddress>().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAddress);
    Ok(())
}

#[test]
fn client_lists_grow_and_bound_check() -> anyhow::Result<()> {
    let mut outputs: List<Output> = List::construct_default();
    assert!(outputs.is_empty());
    outputs.push_back(Output::new(5, Default::default()))?;
    outputs.push_back(Output::new(7, Default::default()))?;
    assert!(!outputs.is_read_only());

    let view = outputs.view();
    assert_eq!(view.count(), 2);
    assert_eq!(view.nth(1)?.value(), 7);
    assert_eq!(view.nth(2).unwrap_err().kind(), ErrorKind::IndexOutOfRange);
    let total: u64 = outputs.iter().map(Output::value).sum();
    assert_eq!(total, 12);
    Ok(())
}
