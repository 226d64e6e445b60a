//! Protocol tests against a mock indexer and an in-memory test wallet.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use ember_electrum::electrum_scripthash;
use ember_electrum::error::RequestError;
use ember_electrum::protocol::{HistoryItem, ScripthashStatus};
use ember_sync::sync::IndexerClient;
use ember_sync::wallet::traits::{SyncKeys, SyncOutputs, SyncTransactions, SyncWallet};
use ember_sync::wallet::{KeyScope, KeyScript, OutPoint, Stxo, Subscription, TxRecord, Utxo};
use ember_sync::{broadcast_with_change, rescan, subscribe, Transaction, TxIn, TxOut};

// ---------------------------------------------------------------- indexer

#[derive(Default)]
struct MockState {
    statuses: HashMap<String, String>,
    histories: HashMap<String, Vec<HistoryItem>>,
    transactions: HashMap<String, Vec<u8>>,
    failing_subscribes: HashSet<String>,
    subscribe_calls: Vec<String>,
    history_calls: usize,
    transaction_calls: usize,
    broadcasts: Vec<Vec<u8>>,
}

#[derive(Clone, Default)]
struct MockIndexer {
    state: Arc<Mutex<MockState>>,
}

impl MockIndexer {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl IndexerClient for MockIndexer {
    fn subscribe_scripthash(
        &self,
        scripthash: &str,
    ) -> impl Future<Output = Result<String, RequestError>> + Send {
        let result = {
            let mut state = self.lock();
            state.subscribe_calls.push(scripthash.to_string());
            if state.failing_subscribes.contains(scripthash) {
                Err(RequestError::ServerNotRunning)
            } else {
                Ok(state.statuses.get(scripthash).cloned().unwrap_or_default())
            }
        };
        async move { result }
    }

    fn unsubscribe_scripthash(
        &self,
        _scripthash: &str,
    ) -> impl Future<Output = Result<bool, RequestError>> + Send {
        async move { Ok(true) }
    }

    fn get_history(
        &self,
        scripthash: &str,
    ) -> impl Future<Output = Result<Vec<HistoryItem>, RequestError>> + Send {
        let result = {
            let mut state = self.lock();
            state.history_calls += 1;
            Ok(state.histories.get(scripthash).cloned().unwrap_or_default())
        };
        async move { result }
    }

    fn get_raw_transaction(
        &self,
        txid: &str,
    ) -> impl Future<Output = Result<Vec<u8>, RequestError>> + Send {
        let result = {
            let mut state = self.lock();
            state.transaction_calls += 1;
            state
                .transactions
                .get(txid)
                .cloned()
                .ok_or_else(|| RequestError::Server {
                    code: 2,
                    message: "no such transaction".to_string(),
                })
        };
        async move { result }
    }

    fn broadcast(
        &self,
        raw_tx: &[u8],
    ) -> impl Future<Output = Result<String, RequestError>> + Send {
        let result = {
            let mut state = self.lock();
            state.broadcasts.push(raw_tx.to_vec());
            Ok(Transaction::decode(raw_tx).unwrap().txid())
        };
        async move { result }
    }
}

// ----------------------------------------------------------------- wallet

const TEST_GAP: usize = 3;

struct KeyEntry {
    key: KeyScript,
    used: bool,
}

#[derive(Default)]
struct TestWallet {
    subs: Vec<Subscription>,
    txns: HashMap<String, TxRecord>,
    utxos: HashMap<OutPoint, Utxo>,
    stxos: HashMap<OutPoint, Stxo>,
    external: Vec<KeyEntry>,
    internal: Vec<KeyEntry>,
    tip: i64,
}

fn test_script(scope: KeyScope, index: usize) -> Vec<u8> {
    let tag = match scope {
        KeyScope::External => 0xe0,
        KeyScope::Internal => 0x10,
    };
    vec![tag, index as u8]
}

impl TestWallet {
    fn new() -> Self {
        let mut wallet = TestWallet::default();
        for _ in 0..TEST_GAP {
            wallet.derive(KeyScope::External);
            wallet.derive(KeyScope::Internal);
        }
        wallet
    }

    fn branch(&self, scope: KeyScope) -> &Vec<KeyEntry> {
        match scope {
            KeyScope::External => &self.external,
            KeyScope::Internal => &self.internal,
        }
    }

    fn branch_mut(&mut self, scope: KeyScope) -> &mut Vec<KeyEntry> {
        match scope {
            KeyScope::External => &mut self.external,
            KeyScope::Internal => &mut self.internal,
        }
    }

    fn derive(&mut self, scope: KeyScope) {
        let index = self.branch(scope).len();
        let entry = KeyEntry {
            key: KeyScript {
                pk_script: test_script(scope, index),
                address: format!("addr-{scope:?}-{index}"),
                scope,
            },
            used: false,
        };
        self.branch_mut(scope).push(entry);
    }

    fn trailing_unused(&self, scope: KeyScope) -> usize {
        self.branch(scope)
            .iter()
            .rev()
            .take_while(|entry| !entry.used)
            .count()
    }
}

impl SyncWallet for TestWallet {
    type Error = Infallible;

    fn subscriptions(&self) -> Result<Vec<Subscription>, Infallible> {
        Ok(self.subs.clone())
    }

    fn subscription_for_scripthash(
        &self,
        scripthash: &str,
    ) -> Result<Option<Subscription>, Infallible> {
        Ok(self
            .subs
            .iter()
            .find(|sub| sub.electrum_scripthash == scripthash)
            .cloned())
    }

    fn subscription_for_script(
        &self,
        pk_script: &str,
    ) -> Result<Option<Subscription>, Infallible> {
        Ok(self.subs.iter().find(|sub| sub.pk_script == pk_script).cloned())
    }

    fn add_subscription(&mut self, subscription: Subscription) -> Result<(), Infallible> {
        if !self.subs.iter().any(|sub| sub.pk_script == subscription.pk_script) {
            self.subs.push(subscription);
        }
        Ok(())
    }

    fn remove_subscription(&mut self, pk_script: &str) -> Result<(), Infallible> {
        self.subs.retain(|sub| sub.pk_script != pk_script);
        Ok(())
    }

    fn is_mine_script(&self, pk_script: &[u8]) -> Result<bool, Infallible> {
        Ok(self
            .external
            .iter()
            .chain(self.internal.iter())
            .any(|entry| entry.key.pk_script == pk_script))
    }

    fn address_for_script(&self, pk_script: &[u8]) -> Result<Option<String>, Infallible> {
        Ok(self
            .external
            .iter()
            .chain(self.internal.iter())
            .find(|entry| entry.key.pk_script == pk_script)
            .map(|entry| entry.key.address.clone()))
    }

    fn tip(&self) -> Result<i64, Infallible> {
        Ok(self.tip)
    }

    fn update_tip(&mut self, height: i64) -> Result<(), Infallible> {
        self.tip = height;
        Ok(())
    }
}

impl SyncTransactions for TestWallet {
    fn transaction(&self, txid: &str) -> Result<Option<TxRecord>, Infallible> {
        Ok(self.txns.get(txid).cloned())
    }

    fn transactions(&self) -> Result<Vec<TxRecord>, Infallible> {
        Ok(self.txns.values().cloned().collect())
    }

    fn put_transaction(&mut self, record: TxRecord) -> Result<(), Infallible> {
        self.txns.insert(record.txid.clone(), record);
        Ok(())
    }
}

impl SyncOutputs for TestWallet {
    fn utxos(&self) -> Result<Vec<Utxo>, Infallible> {
        Ok(self.utxos.values().cloned().collect())
    }

    fn stxos(&self) -> Result<Vec<Stxo>, Infallible> {
        Ok(self.stxos.values().cloned().collect())
    }

    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, Infallible> {
        Ok(self.utxos.get(outpoint).cloned())
    }

    fn has_stxo(&self, outpoint: &OutPoint) -> Result<bool, Infallible> {
        Ok(self.stxos.contains_key(outpoint))
    }

    fn add_utxo(&mut self, utxo: Utxo) -> Result<(), Infallible> {
        self.utxos.insert(utxo.outpoint.clone(), utxo);
        Ok(())
    }

    fn spend_utxo(
        &mut self,
        outpoint: &OutPoint,
        spend_height: i64,
        spend_txid: &str,
    ) -> Result<Option<Stxo>, Infallible> {
        Ok(self.utxos.remove(outpoint).map(|utxo| {
            let stxo = Stxo {
                utxo,
                spend_height,
                spend_txid: spend_txid.to_string(),
            };
            self.stxos.insert(outpoint.clone(), stxo.clone());
            stxo
        }))
    }

    fn freeze_utxo(&mut self, outpoint: &OutPoint) -> Result<(), Infallible> {
        if let Some(utxo) = self.utxos.get_mut(outpoint) {
            utxo.frozen = true;
        }
        Ok(())
    }

    fn unfreeze_utxo(&mut self, outpoint: &OutPoint) -> Result<(), Infallible> {
        if let Some(utxo) = self.utxos.get_mut(outpoint) {
            utxo.frozen = false;
        }
        Ok(())
    }
}

impl SyncKeys for TestWallet {
    fn unused_scripts(&self, scope: KeyScope) -> Result<Vec<KeyScript>, Infallible> {
        Ok(self
            .branch(scope)
            .iter()
            .filter(|entry| !entry.used)
            .map(|entry| entry.key.clone())
            .collect())
    }

    fn mark_script_used(&mut self, pk_script: &[u8]) -> Result<(), Infallible> {
        for scope in [KeyScope::External, KeyScope::Internal] {
            let position = self
                .branch(scope)
                .iter()
                .position(|entry| entry.key.pk_script == pk_script);
            if let Some(position) = position {
                self.branch_mut(scope)[position].used = true;
                while self.trailing_unused(scope) < TEST_GAP {
                    self.derive(scope);
                }
            }
        }
        Ok(())
    }

    fn unused_key(&mut self, scope: KeyScope) -> Result<KeyScript, Infallible> {
        if self.branch(scope).iter().all(|entry| entry.used) {
            self.derive(scope);
        }
        Ok(self
            .branch(scope)
            .iter()
            .find(|entry| !entry.used)
            .map(|entry| entry.key.clone())
            .expect("derived above"))
    }
}

// ---------------------------------------------------------------- helpers

fn payment_to(script: &[u8], value: i64) -> Transaction {
    Transaction {
        version: 2,
        inputs: vec![TxIn {
            prev_txid: [0x42; 32],
            prev_vout: 0,
            script_sig: Vec::new(),
            sequence: 0xffff_ffff,
            witness: Vec::new(),
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: script.to_vec(),
        }],
        lock_time: 0,
    }
}

// ------------------------------------------------------------------ tests

#[tokio::test]
async fn status_change_imports_history() {
    let owned = test_script(KeyScope::External, 0);
    let scripthash = electrum_scripthash(&owned);

    let tx_a = payment_to(&owned, 70_000);
    let mut tx_b = payment_to(&owned, 30_000);
    tx_b.lock_time = 1; // distinct txid

    let client = MockIndexer::default();
    {
        let mut state = client.lock();
        state.statuses.insert(scripthash.clone(), "abc123".to_string());
        state.histories.insert(
            scripthash.clone(),
            vec![
                HistoryItem {
                    tx_hash: tx_a.txid(),
                    height: 100,
                    fee: None,
                },
                HistoryItem {
                    tx_hash: tx_b.txid(),
                    height: 0,
                    fee: Some(190),
                },
            ],
        );
        state.transactions.insert(tx_a.txid(), tx_a.encode(true));
        state.transactions.insert(tx_b.txid(), tx_b.encode(true));
    }

    let mut initial = TestWallet::new();
    initial.subs.push(Subscription::for_script(&owned, "addr-External-0"));
    let wallet = Arc::new(RwLock::new(initial));

    let (status_tx, status_rx) = mpsc::channel(16);
    let (tip_tx, tip_rx) = watch::channel(0i64);
    let (epoch_tx, epoch_rx) = watch::channel(1u64);
    let cancel = CancellationToken::new();
    let engine = tokio::spawn(ember_sync::sync(
        client.clone(),
        wallet.clone(),
        status_rx,
        tip_rx,
        epoch_rx,
        cancel.clone(),
    ));

    // the startup pass re-subscribes and imports both transactions
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if wallet.read().await.txns.len() == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "import timed out");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    {
        let wallet_guard = wallet.read().await;
        assert_eq!(wallet_guard.txns[&tx_a.txid()].height, 100);
        assert_eq!(wallet_guard.txns[&tx_b.txid()].height, 0);
        assert_eq!(wallet_guard.utxos.len(), 2);
        assert_eq!(wallet_guard.txns[&tx_a.txid()].value, 70_000);
    }
    let (history_calls, transaction_calls) = {
        let state = client.lock();
        (state.history_calls, state.transaction_calls)
    };
    assert_eq!(history_calls, 1);
    assert_eq!(transaction_calls, 2);

    // an identical status performs no further requests
    status_tx
        .send(ScripthashStatus {
            scripthash: scripthash.clone(),
            status: "abc123".to_string(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.lock().history_calls, history_calls);
    assert_eq!(client.lock().transaction_calls, transaction_calls);

    // tip changes reach the wallet
    tip_tx.send(1234).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(wallet.read().await.tip, 1234);

    // a leader failover re-arms the stored subscription on the new session
    let subscribes_before = client.lock().subscribe_calls.len();
    epoch_tx.send(2).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.lock().subscribe_calls.len(), subscribes_before + 1);
    // status unchanged, so no history was refetched
    assert_eq!(client.lock().history_calls, history_calls);

    cancel.cancel();
    engine.await.unwrap().unwrap();
}

#[tokio::test]
async fn confirmed_spend_moves_utxo_to_stxo() {
    let owned = test_script(KeyScope::External, 0);
    let funding = payment_to(&owned, 50_000);

    let mut spend = payment_to(&[0x99, 0x99], 49_000);
    spend.inputs[0].prev_txid = {
        let mut wire = [0u8; 32];
        let display = hex::decode(funding.txid()).unwrap();
        wire.copy_from_slice(&display);
        wire.reverse();
        wire
    };
    spend.inputs[0].prev_vout = 0;

    let wallet = Arc::new(RwLock::new(TestWallet::new()));
    {
        let mut wallet_guard = wallet.write().await;
        ember_sync::ingest_transaction(
            &mut *wallet_guard,
            &funding,
            &funding.encode(true),
            80,
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(wallet_guard.utxos.len(), 1);

        ember_sync::ingest_transaction(
            &mut *wallet_guard,
            &spend,
            &spend.encode(true),
            81,
            1_700_000_100,
        )
        .unwrap();
        assert!(wallet_guard.utxos.is_empty());
        let stxo = wallet_guard
            .stxos
            .get(&OutPoint::new(funding.txid(), 0))
            .unwrap();
        assert_eq!(stxo.spend_height, 81);
        assert_eq!(stxo.spend_txid, spend.txid());
        // the spend debits the wallet
        assert_eq!(wallet_guard.txns[&spend.txid()].value, -50_000);
    }
}

#[tokio::test]
async fn broadcast_subscribes_the_change_output() {
    let change_script = test_script(KeyScope::Internal, 0);
    let mut tx = payment_to(&[0x77, 0x01], 10_000);
    tx.outputs.push(TxOut {
        value: 5_000,
        script_pubkey: change_script.clone(),
    });

    let client = MockIndexer::default();
    let wallet = Arc::new(RwLock::new(TestWallet::new()));

    let txid = broadcast_with_change(&client, &wallet, &tx, Some(1))
        .await
        .unwrap();
    assert_eq!(txid, tx.txid());

    let change_scripthash = electrum_scripthash(&change_script);
    assert!(client.lock().subscribe_calls.contains(&change_scripthash));
    let stored = wallet
        .read()
        .await
        .subscription_for_script(&hex::encode(&change_script))
        .unwrap()
        .expect("change subscription recorded");
    assert_eq!(stored.electrum_scripthash, change_scripthash);
    assert_eq!(stored.address, "addr-Internal-0");
}

#[tokio::test]
async fn failed_change_watch_is_compensated() {
    let change_script = test_script(KeyScope::Internal, 0);
    let mut tx = payment_to(&[0x77, 0x02], 10_000);
    tx.outputs.push(TxOut {
        value: 5_000,
        script_pubkey: change_script.clone(),
    });

    let client = MockIndexer::default();
    client
        .lock()
        .failing_subscribes
        .insert(electrum_scripthash(&change_script));
    let wallet = Arc::new(RwLock::new(TestWallet::new()));

    // the broadcast still succeeds; only the watch setup failed
    let txid = broadcast_with_change(&client, &wallet, &tx, Some(1))
        .await
        .unwrap();
    assert_eq!(txid, tx.txid());
    assert!(wallet
        .read()
        .await
        .subscription_for_script(&hex::encode(&change_script))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn out_of_range_change_index_is_rejected() {
    let client = MockIndexer::default();
    let wallet = Arc::new(RwLock::new(TestWallet::new()));
    let tx = payment_to(&[0x77, 0x03], 10_000);
    let result = broadcast_with_change(&client, &wallet, &tx, Some(5)).await;
    assert!(result.is_err());
    assert!(client.lock().broadcasts.is_empty());
}

#[tokio::test]
async fn rescan_walks_the_gap_window() {
    let key0 = test_script(KeyScope::External, 0);
    let funding = payment_to(&key0, 25_000);

    let client = MockIndexer::default();
    {
        let mut state = client.lock();
        let scripthash = electrum_scripthash(&key0);
        state.statuses.insert(scripthash.clone(), "aa".to_string());
        state.histories.insert(
            scripthash,
            vec![HistoryItem {
                tx_hash: funding.txid(),
                height: 10,
                fee: None,
            }],
        );
        state.transactions.insert(funding.txid(), funding.encode(true));
    }

    let wallet = Arc::new(RwLock::new(TestWallet::new()));
    rescan(&client, &wallet).await.unwrap();

    let wallet_guard = wallet.read().await;
    // key 0 was discovered used, so exactly one key now exists beyond the
    // original window and the trailing unused run is a full gap again
    assert_eq!(wallet_guard.external.len(), TEST_GAP + 1);
    assert!(wallet_guard.external[0].used);
    assert_eq!(wallet_guard.trailing_unused(KeyScope::External), TEST_GAP);
    // every window script ended up subscribed, internal branch included
    assert_eq!(wallet_guard.subs.len(), TEST_GAP + 1 + TEST_GAP);
    assert_eq!(wallet_guard.txns.len(), 1);
    assert_eq!(wallet_guard.utxos.len(), 1);
}

#[tokio::test]
async fn subscribe_then_unsubscribe_is_clean() {
    let script = test_script(KeyScope::External, 1);
    let client = MockIndexer::default();
    let wallet = Arc::new(RwLock::new(TestWallet::new()));

    let sub = Subscription::for_script(&script, "addr-External-1");
    let status = subscribe(&client, &wallet, sub.clone()).await.unwrap();
    assert_eq!(status, "");
    assert_eq!(wallet.read().await.subs.len(), 1);

    ember_sync::unsubscribe(&client, &wallet, &sub.pk_script)
        .await
        .unwrap();
    assert!(wallet.read().await.subs.is_empty());
}
