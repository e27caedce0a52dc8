//! 客户端注册表与选择策略
//!
//! 每个地址最多一个 [`TransferClient`]。每次新注册分配单调递增的序号，
//! 刷新已有条目时保留原序号；回退选择取序号最小（最早成功连接）的条目。

use crate::client::TransferClient;
use crate::peripheral::{Address, TransportPeripheral};
use std::collections::HashMap;

struct Entry {
    client: TransferClient,
    seq: u64,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<Address, Entry>,
    next_seq: u64,
}

impl Registry {
    /// 注册或刷新外设对应的客户端
    pub fn upsert(&mut self, peripheral: TransportPeripheral) -> TransferClient {
        let address = peripheral.address();
        let client = TransferClient::new(peripheral);
        let seq = match self.entries.get(&address) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.entries.insert(
            address,
            Entry {
                client: client.clone(),
                seq,
            },
        );
        client
    }

    pub fn remove(&mut self, address: &Address) -> Option<TransferClient> {
        self.entries.remove(address).map(|e| e.client)
    }

    pub fn get(&self, address: &Address) -> Option<&TransferClient> {
        self.entries.get(address).map(|e| &e.client)
    }

    /// 最早成功连接的客户端
    pub fn first(&self) -> Option<&TransferClient> {
        self.entries
            .values()
            .min_by_key(|e| e.seq)
            .map(|e| &e.client)
    }

    /// 按连接先后排列的地址
    pub fn addresses(&self) -> Vec<Address> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries.into_iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 选择策略：仍在注册表中的用户选择优先，否则最早连接的条目
    pub fn select(&self, user_selection: Option<&Address>) -> Option<TransferClient> {
        user_selection
            .and_then(|address| self.get(address))
            .or_else(|| self.first())
            .cloned()
    }
}
