use crate::store::ListStore;
use nw_core::{Address, Direction, FwError, Intent, Position, Target, Verdict};
use nw_nft::{Applier, Host, NftEngine, RulePredicate};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// Appended drop rules
    Blacklist,
    /// Accept rules inserted at the head of each chain
    Whitelist,
}

impl ListKind {
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::Blacklist => Verdict::Drop,
            Self::Whitelist => Verdict::Accept,
        }
    }

    pub fn position(&self) -> Position {
        match self {
            Self::Blacklist => Position::Append,
            Self::Whitelist => Position::Insert,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blacklist => "blacklist",
            Self::Whitelist => "whitelist",
        }
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListChange {
    Added,
    /// Already in the store; no rules were added
    AlreadyListed,
    Removed { input: Vec<u64>, output: Vec<u64> },
    /// Neither stored nor present as a rule
    NotListed,
}

/// A named list whose every entry is mirrored as one input rule on the
/// source address and one output rule on the destination address.
pub struct ListManager<'a, E, H, S> {
    applier: &'a Applier<E, H>,
    store: S,
    kind: ListKind,
    input: Target,
    output: Target,
}

impl<'a, E: NftEngine, H: Host, S: ListStore> ListManager<'a, E, H, S> {
    pub fn new(applier: &'a Applier<E, H>, kind: ListKind, store: S, input: Target, output: Target) -> Self {
        Self {
            applier,
            store,
            kind,
            input,
            output,
        }
    }

    pub fn entries(&self) -> Result<Vec<Address>, FwError> {
        self.store.read()
    }

    /// Apply both rules, then record the address
    pub async fn add(&self, address: Address) -> Result<ListChange, FwError> {
        if self.store.contains(&address)? {
            debug!(list = %self.kind, %address, "already listed");
            return Ok(ListChange::AlreadyListed);
        }

        self.apply_pair(address).await?;
        self.store.append(&address)?;

        info!(list = %self.kind, %address, "address added");
        Ok(ListChange::Added)
    }

    /// Delete every mirrored rule for the address, then drop it from the store.
    /// A missing chain holds no rules, so the stored entry is still removed.
    pub async fn remove(&self, address: Address) -> Result<ListChange, FwError> {
        let input = self
            .delete_existing_rules(&self.input, Direction::Source, &address)
            .await?;
        let output = self
            .delete_existing_rules(&self.output, Direction::Destination, &address)
            .await?;

        let entries = self.store.read()?;
        let listed = entries.contains(&address);
        if listed {
            let remaining: Vec<Address> = entries.into_iter().filter(|a| *a != address).collect();
            self.store.rewrite(&remaining)?;
        }

        if !listed && input.is_empty() && output.is_empty() {
            return Ok(ListChange::NotListed);
        }

        info!(
            list = %self.kind,
            %address,
            rules = input.len() + output.len(),
            "address removed"
        );
        Ok(ListChange::Removed { input, output })
    }

    /// Rebuild the rule pair of every stored address, e.g. after a flush.
    /// Existing copies are deleted first so each address ends with exactly one pair.
    pub async fn sync(&self) -> Result<usize, FwError> {
        let entries = self.store.read()?;

        for address in &entries {
            self.delete_existing_rules(&self.input, Direction::Source, address)
                .await?;
            self.delete_existing_rules(&self.output, Direction::Destination, address)
                .await?;
            self.apply_pair(*address).await?;
        }

        info!(list = %self.kind, count = entries.len(), "list synchronised");
        Ok(entries.len())
    }

    async fn apply_pair(&self, address: Address) -> Result<(), FwError> {
        for (target, direction) in [
            (&self.input, Direction::Source),
            (&self.output, Direction::Destination),
        ] {
            self.applier
                .apply(&Intent::FilterAddress {
                    target: target.clone(),
                    address,
                    direction,
                    verdict: self.kind.verdict(),
                    position: self.kind.position(),
                })
                .await?;
        }
        Ok(())
    }

    async fn delete_existing_rules(
        &self,
        chain: &Target,
        direction: Direction,
        address: &Address,
    ) -> Result<Vec<u64>, FwError> {
        if !self.chain_exists(chain).await {
            debug!(list = %self.kind, chain = %chain, "chain absent, nothing to delete");
            return Ok(vec![]);
        }
        let predicate = RulePredicate::address(direction, address, self.kind.verdict());
        self.applier.delete_matching(chain, &predicate).await
    }

    async fn chain_exists(&self, chain: &Target) -> bool {
        self.applier.list_rules(chain).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileListStore;
    use nw_core::Family;
    use nw_nft::fake::{FakeHost, FakeNft};

    fn chains() -> (Target, Target) {
        (
            Target::new(Family::Inet, "filter", "input"),
            Target::new(Family::Inet, "filter", "output"),
        )
    }

    fn manager<'a>(
        applier: &'a Applier<FakeNft, FakeHost>,
        kind: ListKind,
        dir: &tempfile::TempDir,
    ) -> ListManager<'a, FakeNft, FakeHost, FileListStore> {
        let (input, output) = chains();
        let store = FileListStore::new(dir.path().join(format!("{}.txt", kind)));
        ListManager::new(applier, kind, store, input, output)
    }

    #[tokio::test]
    async fn blacklist_round_trip_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let blacklist = manager(&applier, ListKind::Blacklist, &dir);
        let (input, output) = chains();
        let ip: Address = "203.0.113.7".parse().unwrap();

        assert_eq!(blacklist.add(ip).await.unwrap(), ListChange::Added);
        assert_eq!(applier.engine().rules(&input), vec!["ip saddr 203.0.113.7 drop"]);
        assert_eq!(applier.engine().rules(&output), vec!["ip daddr 203.0.113.7 drop"]);
        assert_eq!(blacklist.entries().unwrap(), vec![ip]);

        let change = blacklist.remove(ip).await.unwrap();
        assert!(matches!(change, ListChange::Removed { ref input, ref output } if input.len() == 1 && output.len() == 1));
        assert!(applier.engine().rules(&input).is_empty());
        assert!(applier.engine().rules(&output).is_empty());
        assert!(blacklist.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn adding_twice_keeps_one_rule_pair() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let blacklist = manager(&applier, ListKind::Blacklist, &dir);
        let ip: Address = "198.51.100.0/24".parse().unwrap();

        blacklist.add(ip).await.unwrap();
        assert_eq!(blacklist.add(ip).await.unwrap(), ListChange::AlreadyListed);
        assert_eq!(applier.engine().rules(&chains().0).len(), 1);
    }

    #[tokio::test]
    async fn whitelist_accept_precedes_existing_block() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let (input, _) = chains();
        let ip: Address = "10.1.2.3".parse().unwrap();

        applier
            .apply(&Intent::block_address(input.clone(), ip))
            .await
            .unwrap();
        manager(&applier, ListKind::Whitelist, &dir)
            .add(ip)
            .await
            .unwrap();

        assert_eq!(
            applier.engine().rules(&input),
            vec!["ip saddr 10.1.2.3 accept", "ip saddr 10.1.2.3 drop"]
        );
    }

    #[tokio::test]
    async fn whitelist_removal_keeps_block_rules() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let (input, _) = chains();
        let ip: Address = "10.1.2.3".parse().unwrap();
        let whitelist = manager(&applier, ListKind::Whitelist, &dir);

        applier
            .apply(&Intent::block_address(input.clone(), ip))
            .await
            .unwrap();
        whitelist.add(ip).await.unwrap();
        whitelist.remove(ip).await.unwrap();

        assert_eq!(applier.engine().rules(&input), vec!["ip saddr 10.1.2.3 drop"]);
    }

    #[tokio::test]
    async fn rejected_rule_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        applier
            .engine()
            .fail_on("ip daddr 203.0.113.9 drop", "Error: Operation not permitted");
        let blacklist = manager(&applier, ListKind::Blacklist, &dir);

        let err = blacklist.add("203.0.113.9".parse().unwrap()).await;
        assert!(err.is_err());
        assert!(blacklist.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn removing_unknown_address_is_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let blacklist = manager(&applier, ListKind::Blacklist, &dir);

        // chains must exist for the handle listing
        blacklist.add("192.0.2.1".parse().unwrap()).await.unwrap();
        let change = blacklist.remove("192.0.2.2".parse().unwrap()).await.unwrap();
        assert_eq!(change, ListChange::NotListed);
    }

    #[tokio::test]
    async fn remove_after_flush_still_clears_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let blacklist = manager(&applier, ListKind::Blacklist, &dir);
        let ip: Address = "203.0.113.7".parse().unwrap();

        blacklist.add(ip).await.unwrap();
        applier.apply(&Intent::FlushRuleset).await.unwrap();

        let change = blacklist.remove(ip).await.unwrap();
        assert_eq!(
            change,
            ListChange::Removed {
                input: vec![],
                output: vec![]
            }
        );
        assert!(blacklist.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_with_one_chain_missing_deletes_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let blacklist = manager(&applier, ListKind::Blacklist, &dir);
        let (input, output) = chains();
        let ip: Address = "203.0.113.8".parse().unwrap();

        blacklist.add(ip).await.unwrap();
        applier.apply(&Intent::FlushChain { chain: input.clone() }).await.unwrap();
        applier.apply(&Intent::DeleteChain { chain: input.clone() }).await.unwrap();

        let change = blacklist.remove(ip).await.unwrap();
        assert!(matches!(change, ListChange::Removed { ref input, ref output } if input.is_empty() && output.len() == 1));
        assert!(applier.engine().rules(&output).is_empty());
        assert!(blacklist.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_restores_rules_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let blacklist = manager(&applier, ListKind::Blacklist, &dir);
        let (input, output) = chains();

        blacklist.add("192.0.2.1".parse().unwrap()).await.unwrap();
        blacklist.add("192.0.2.2".parse().unwrap()).await.unwrap();
        applier.apply(&Intent::FlushRuleset).await.unwrap();
        assert!(applier.engine().rules(&input).is_empty());

        assert_eq!(blacklist.sync().await.unwrap(), 2);
        assert_eq!(applier.engine().rules(&input).len(), 2);
        assert_eq!(applier.engine().rules(&output).len(), 2);

        // a second sync does not duplicate
        blacklist.sync().await.unwrap();
        assert_eq!(applier.engine().rules(&input).len(), 2);
    }
}
