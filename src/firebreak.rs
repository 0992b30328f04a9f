//! Firebreak: pooled-position lending vault with an embedded risk engine.
//!
//! Many users share one aggregate position in an external money market while
//! an internal ledger tracks each user's own collateral and debt. A designated
//! underwriter posts buffer liquidity and may preemptively liquidate internal
//! positions whose health factor falls below one, capturing the liquidation
//! bonus before the market's own liquidators can.
//!
//! The risk arithmetic replicates the mirrored market's fixed-point formulas
//! exactly (half-up percentage and wad rounding, floored weighted averages) so
//! that an internally computed health factor matches the market's own report
//! for an equivalent standalone position.

#![deny(unsafe_code)]

// 1. mod constants
pub mod constants {
    use crate::ledger::PositionLedger;
    use crate::registry::AssetRegistry;
    use crate::state::StateHeader;
    use core::mem::size_of;

    pub const MAGIC: u64 = 0x4649524542524b31; // "FIREBRK1"
    pub const VERSION: u32 = 1;

    // MAX_USERS is feature-configured, not target-configured.
    // Every build of a given feature set lays out the same slab.
    #[cfg(kani)]
    pub const MAX_USERS: usize = 4; // Small for fast formal verification

    #[cfg(all(feature = "test", not(kani)))]
    pub const MAX_USERS: usize = 64; // Small for tests

    #[cfg(all(not(kani), not(feature = "test")))]
    pub const MAX_USERS: usize = 1024; // Production

    pub const BITMAP_WORDS: usize = (MAX_USERS + 63) / 64;
    pub const MAX_ASSETS: usize = 16;

    /// 18-decimal fixed-point unit shared with the external market's math.
    pub const WAD: u128 = 1_000_000_000_000_000_000;
    pub const HALF_WAD: u128 = WAD / 2;
    /// Basis-point denominator; risk ratios are expressed in bps.
    pub const PERCENTAGE_FACTOR: u128 = 10_000;
    pub const HALF_PERCENTAGE_FACTOR: u128 = 5_000;
    /// Health factors below one wad mark a position liquidatable.
    pub const HEALTH_FACTOR_LIQUIDATION_THRESHOLD: u128 = WAD;
    /// Largest share of a user's debt one preemption may repay.
    pub const CLOSE_FACTOR_BPS: u64 = 5_000;

    pub const fn pad16(len: usize) -> usize {
        (16 - (len % 16)) % 16
    }

    // State snapshot layout: ledger, then registry, then header.
    pub const LEDGER_OFF: usize = 0;
    pub const LEDGER_LEN: usize = size_of::<PositionLedger>();
    pub const REGISTRY_OFF: usize = LEDGER_OFF + LEDGER_LEN;
    pub const REGISTRY_LEN: usize = size_of::<AssetRegistry>();
    pub const HEADER_OFF: usize = REGISTRY_OFF + REGISTRY_LEN;
    pub const HEADER_LEN: usize = size_of::<StateHeader>();
    pub const STATE_LEN: usize = HEADER_OFF + HEADER_LEN;
}

// 2. mod math
pub mod math {
    use crate::constants::{HALF_PERCENTAGE_FACTOR, HALF_WAD, PERCENTAGE_FACTOR, WAD};
    use crate::error::{Result, VaultError};
    use alloy_primitives::U256;

    #[inline]
    pub fn u256(x: u128) -> U256 {
        U256::from(x)
    }

    #[inline]
    pub fn to_u128(x: U256) -> Result<u128> {
        u128::try_from(x).map_err(|_| VaultError::MathOverflow)
    }

    /// `a * bps / 1e4`, rounding half up. The market's percentage multiply.
    pub fn percent_mul(a: U256, bps: U256) -> Result<U256> {
        let scaled = a
            .checked_mul(bps)
            .and_then(|p| p.checked_add(U256::from(HALF_PERCENTAGE_FACTOR)))
            .ok_or(VaultError::MathOverflow)?;
        Ok(scaled / U256::from(PERCENTAGE_FACTOR))
    }

    /// `a * 1e4 / bps`, rounding half up. The market's percentage divide.
    pub fn percent_div(a: U256, bps: U256) -> Result<U256> {
        if bps.is_zero() {
            return Err(VaultError::MathOverflow);
        }
        let half = bps / U256::from(2u8);
        let scaled = a
            .checked_mul(U256::from(PERCENTAGE_FACTOR))
            .and_then(|p| p.checked_add(half))
            .ok_or(VaultError::MathOverflow)?;
        Ok(scaled / bps)
    }

    /// `a * 1e18 / b`, rounding half up. The market's wad divide.
    pub fn wad_div(a: U256, b: U256) -> Result<U256> {
        if b.is_zero() {
            return Err(VaultError::MathOverflow);
        }
        let half = b / U256::from(2u8);
        let scaled = a
            .checked_mul(U256::from(WAD))
            .and_then(|p| p.checked_add(half))
            .ok_or(VaultError::MathOverflow)?;
        Ok(scaled / b)
    }

    /// `a * b / 1e18`, rounding half up.
    pub fn wad_mul(a: U256, b: U256) -> Result<U256> {
        let scaled = a
            .checked_mul(b)
            .and_then(|p| p.checked_add(U256::from(HALF_WAD)))
            .ok_or(VaultError::MathOverflow)?;
        Ok(scaled / U256::from(WAD))
    }

    /// `10^decimals`, the unit divisor turning token units into whole tokens.
    pub fn pow10(decimals: u8) -> Result<U256> {
        U256::from(10u8)
            .checked_pow(U256::from(decimals))
            .ok_or(VaultError::MathOverflow)
    }
}

// 3. mod error
pub mod error {
    use thiserror::Error;

    /// Refusals reported at the external market boundary.
    #[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
    pub enum AdapterError {
        #[error("market operation is paused")]
        Paused,
        #[error("reserve has insufficient liquidity")]
        InsufficientLiquidity,
        #[error("position cannot support the borrow")]
        CollateralCannotCoverBorrow,
        #[error("withdrawal would leave the position unhealthy")]
        WithdrawalNotAllowed,
        #[error("position is healthy")]
        HealthyPosition,
        #[error("no outstanding debt")]
        NoDebt,
        #[error("asset is not listed")]
        UnknownAsset,
        #[error("insufficient token balance")]
        InsufficientBalance,
        #[error("insufficient token allowance")]
        InsufficientAllowance,
        #[error("arithmetic overflow")]
        Overflow,
    }

    #[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
    pub enum VaultError {
        /// Caller lacks the role the operation requires.
        #[error("caller is not authorized")]
        Unauthorized,
        /// The caller's own position would end below the liquidation line.
        #[error("health factor would drop below one")]
        InsufficientHealthFactor,
        /// Preemption target is not liquidatable.
        #[error("target position is healthy")]
        PositionHealthy,
        /// Requested repayment exceeds the close-factor share of the debt.
        #[error("repayment exceeds the close factor")]
        RepaymentExceedsCloseFactor,
        /// The external market refused a paired call.
        #[error("external market rejected the call")]
        AdapterRejected,
        /// The external market refused the aggregate borrow even though the
        /// caller's own share passed its check. Surfaced distinctly because it
        /// means the ledger and the aggregate position disagree on headroom.
        #[error("external market rejected the aggregate borrow")]
        AdapterBorrowRejected,
        #[error("asset is not registered")]
        UnknownAsset,
        #[error("user has no ledger entry")]
        UnknownUser,
        #[error("insufficient balance")]
        InsufficientBalance,
        #[error("insufficient allowance")]
        InsufficientAllowance,
        #[error("amount must be positive")]
        AmountZero,
        #[error("no outstanding debt to repay")]
        NoOutstandingDebt,
        #[error("position still has balances")]
        PositionNotEmpty,
        #[error("arithmetic overflow")]
        MathOverflow,
        #[error("ledger slab is full")]
        LedgerFull,
        #[error("asset registry is full")]
        AssetLimit,
        #[error("asset configuration is invalid")]
        InvalidAssetConfig,
        #[error("state bytes have the wrong length")]
        InvalidStateLen,
        #[error("state bytes are not initialized")]
        NotInitialized,
        #[error("state version is not supported")]
        InvalidVersion,
        #[error("asset still has ledger balances")]
        AssetInUse,
    }

    impl VaultError {
        /// Stable numeric code for integrators.
        pub fn code(self) -> u32 {
            self as u32
        }
    }

    pub type Result<T> = core::result::Result<T, VaultError>;
    pub type AdapterResult<T> = core::result::Result<T, AdapterError>;

    /// Map an adapter refusal on a paired call. Balance and allowance
    /// preconditions are checked before any interaction, so a refusal here is
    /// reported as the market rejecting the call.
    pub fn map_adapter_error(_e: AdapterError) -> VaultError {
        VaultError::AdapterRejected
    }

    /// Borrow-path mapping. Only the aggregate-cannot-support refusal is the
    /// divergence signal; a paused market or drained reserve is an ordinary
    /// rejection like on any other paired call.
    pub fn map_borrow_error(e: AdapterError) -> VaultError {
        match e {
            AdapterError::CollateralCannotCoverBorrow => VaultError::AdapterBorrowRejected,
            other => map_adapter_error(other),
        }
    }
}

// 4. mod registry
pub mod registry {
    use crate::constants::{MAX_ASSETS, PERCENTAGE_FACTOR};
    use crate::error::{Result, VaultError};
    use alloy_primitives::Address;
    use bytemuck::{Pod, Zeroable};

    /// Per-asset risk parameters in the external market's own scales.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct AssetConfig {
        pub address: [u8; 20],
        pub decimals: u8,
        pub active: u8,
        pub _padding: [u8; 2],
        /// Loan-to-value in basis points.
        pub ltv_bps: u64,
        /// Share of collateral value counted toward the health factor, bps.
        pub liquidation_threshold_bps: u64,
        /// Seize multiplier in bps; 10_500 pays the preemptor a 5% bonus.
        pub liquidation_bonus_bps: u64,
    }

    impl AssetConfig {
        pub fn new(
            asset: Address,
            decimals: u8,
            ltv_bps: u64,
            liquidation_threshold_bps: u64,
            liquidation_bonus_bps: u64,
        ) -> Self {
            let mut address = [0u8; 20];
            address.copy_from_slice(asset.as_slice());
            Self {
                address,
                decimals,
                active: 1,
                _padding: [0; 2],
                ltv_bps,
                liquidation_threshold_bps,
                liquidation_bonus_bps,
            }
        }

        pub fn asset(&self) -> Address {
            Address::from(self.address)
        }

        pub fn is_active(&self) -> bool {
            self.active != 0
        }
    }

    /// Fixed table of asset configurations. Admin-gated writes happen in the
    /// vault layer; the registry itself only validates shape.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct AssetRegistry {
        pub assets: [AssetConfig; MAX_ASSETS],
        pub len: u32,
        pub _padding: [u8; 4],
    }

    impl AssetRegistry {
        pub fn new() -> Self {
            Self::zeroed()
        }

        /// Insert or update the configuration for an asset.
        /// Thresholds must satisfy ltv <= liquidation threshold <= 100% and
        /// the bonus must be at least 100%.
        pub fn configure(&mut self, config: AssetConfig) -> Result<usize> {
            if config.ltv_bps > config.liquidation_threshold_bps
                || config.liquidation_threshold_bps > PERCENTAGE_FACTOR as u64
                || config.liquidation_bonus_bps < PERCENTAGE_FACTOR as u64
            {
                return Err(VaultError::InvalidAssetConfig);
            }
            for i in 0..self.len as usize {
                if self.assets[i].address == config.address {
                    self.assets[i] = config;
                    return Ok(i);
                }
            }
            let idx = self.len as usize;
            if idx >= MAX_ASSETS {
                return Err(VaultError::AssetLimit);
            }
            self.assets[idx] = config;
            self.len += 1;
            Ok(idx)
        }

        /// Registry slot for an active asset.
        pub fn index_of(&self, asset: Address) -> Result<usize> {
            for i in 0..self.len as usize {
                if self.assets[i].asset() == asset {
                    if !self.assets[i].is_active() {
                        return Err(VaultError::UnknownAsset);
                    }
                    return Ok(i);
                }
            }
            Err(VaultError::UnknownAsset)
        }

        pub fn get(&self, asset: Address) -> Result<&AssetConfig> {
            self.index_of(asset).map(|i| &self.assets[i])
        }

        /// Active configurations with their registry slots.
        pub fn iter_active(&self) -> impl Iterator<Item = (usize, &AssetConfig)> {
            self.assets[..self.len as usize]
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_active())
        }
    }

    impl Default for AssetRegistry {
        fn default() -> Self {
            Self::new()
        }
    }
}

// 5. mod ledger
pub mod ledger {
    use crate::constants::{pad16, BITMAP_WORDS, MAX_ASSETS, MAX_USERS};
    use crate::error::{Result, VaultError};
    use alloy_primitives::Address;
    use bytemuck::{Pod, Zeroable};

    pub const NO_SLOT: u16 = u16::MAX;

    const TAIL_PAD: usize = pad16(8 * BITMAP_WORDS + 2 * MAX_USERS + 4);

    /// One user's share of the pooled position, amounts in asset units and
    /// indexed by registry slot.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct UserPosition {
        pub collateral: [u128; MAX_ASSETS],
        pub debt: [u128; MAX_ASSETS],
        pub owner: [u8; 20],
        pub _padding: [u8; 12],
    }

    impl UserPosition {
        pub fn owner_address(&self) -> Address {
            Address::from(self.owner)
        }

        pub fn is_empty(&self) -> bool {
            self.collateral.iter().all(|&c| c == 0) && self.debt.iter().all(|&d| d == 0)
        }
    }

    /// Fixed slab of user positions with an occupancy bitmap and freelist.
    /// Per-asset totals are maintained on every mutation so the aggregate view
    /// is O(1); `check_totals` recomputes them for verification.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct PositionLedger {
        pub users: [UserPosition; MAX_USERS],
        /// Sum of collateral over all used slots, one entry per registry slot.
        pub total_collateral: [u128; MAX_ASSETS],
        /// Sum of debt over all used slots, one entry per registry slot.
        pub total_debt: [u128; MAX_ASSETS],
        pub used: [u64; BITMAP_WORDS],
        pub next_free: [u16; MAX_USERS],
        pub num_used: u16,
        pub free_head: u16,
        pub _padding: [u8; TAIL_PAD],
    }

    impl PositionLedger {
        pub fn new() -> Self {
            let mut ledger = Self::zeroed();
            ledger.init_freelist();
            ledger
        }

        /// Heap-allocated construction. At production capacity the slab is
        /// hundreds of kilobytes, too large to build or move on the stack.
        pub fn new_boxed() -> Box<Self> {
            let mut ledger: Box<Self> = bytemuck::zeroed_box();
            ledger.init_freelist();
            ledger
        }

        // Freelist: 0 -> 1 -> ... -> MAX_USERS-1 -> NONE
        fn init_freelist(&mut self) {
            for i in 0..MAX_USERS - 1 {
                self.next_free[i] = (i + 1) as u16;
            }
            self.next_free[MAX_USERS - 1] = NO_SLOT;
        }

        // ========================================
        // Bitmap helpers
        // ========================================

        pub fn is_used(&self, idx: usize) -> bool {
            if idx >= MAX_USERS {
                return false;
            }
            let w = idx >> 6;
            let b = idx & 63;
            ((self.used[w] >> b) & 1) == 1
        }

        fn set_used(&mut self, idx: usize) {
            let w = idx >> 6;
            let b = idx & 63;
            self.used[w] |= 1u64 << b;
        }

        fn clear_used(&mut self, idx: usize) {
            let w = idx >> 6;
            let b = idx & 63;
            self.used[w] &= !(1u64 << b);
        }

        pub fn for_each_used<F: FnMut(usize, &UserPosition)>(&self, mut f: F) {
            for (block, word) in self.used.iter().copied().enumerate() {
                let mut w = word;
                while w != 0 {
                    let bit = w.trailing_zeros() as usize;
                    let idx = block * 64 + bit;
                    w &= w - 1; // Clear lowest bit
                    if idx >= MAX_USERS {
                        continue; // Guard against stray high bits
                    }
                    f(idx, &self.users[idx]);
                }
            }
        }

        // ========================================
        // Slot allocation
        // ========================================

        fn alloc_slot(&mut self) -> Result<u16> {
            if self.free_head == NO_SLOT {
                return Err(VaultError::LedgerFull);
            }
            let idx = self.free_head;
            self.free_head = self.next_free[idx as usize];
            self.set_used(idx as usize);
            self.num_used = self.num_used.saturating_add(1);
            Ok(idx)
        }

        pub fn free_slot(&mut self, idx: u16) {
            if !self.is_used(idx as usize) {
                return;
            }
            self.users[idx as usize] = UserPosition::zeroed();
            self.clear_used(idx as usize);
            self.next_free[idx as usize] = self.free_head;
            self.free_head = idx;
            self.num_used = self.num_used.saturating_sub(1);
        }

        pub fn find(&self, owner: Address) -> Option<u16> {
            let mut found = None;
            self.for_each_used(|idx, position| {
                if found.is_none() && position.owner_address() == owner {
                    found = Some(idx as u16);
                }
            });
            found
        }

        pub fn require_slot(&self, owner: Address) -> Result<u16> {
            self.find(owner).ok_or(VaultError::UnknownUser)
        }

        pub fn get_or_create(&mut self, owner: Address) -> Result<(u16, bool)> {
            if let Some(idx) = self.find(owner) {
                return Ok((idx, false));
            }
            let idx = self.alloc_slot()?;
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(owner.as_slice());
            self.users[idx as usize].owner = bytes;
            Ok((idx, true))
        }

        /// Release a slot whose balances have all been cleared.
        pub fn close(&mut self, idx: u16) -> Result<()> {
            if !self.is_used(idx as usize) {
                return Err(VaultError::UnknownUser);
            }
            if !self.users[idx as usize].is_empty() {
                return Err(VaultError::PositionNotEmpty);
            }
            self.free_slot(idx);
            Ok(())
        }

        // ========================================
        // Balances and maintained totals
        // ========================================

        pub fn collateral(&self, idx: u16, asset_idx: usize) -> u128 {
            self.users[idx as usize].collateral[asset_idx]
        }

        pub fn debt(&self, idx: u16, asset_idx: usize) -> u128 {
            self.users[idx as usize].debt[asset_idx]
        }

        /// Set a collateral balance and maintain the per-asset total.
        /// All code paths that modify collateral go through here.
        pub fn set_collateral(&mut self, idx: u16, asset_idx: usize, new_amount: u128) {
            let old = self.users[idx as usize].collateral[asset_idx];
            if new_amount >= old {
                self.total_collateral[asset_idx] =
                    self.total_collateral[asset_idx].saturating_add(new_amount - old);
            } else {
                self.total_collateral[asset_idx] =
                    self.total_collateral[asset_idx].saturating_sub(old - new_amount);
            }
            self.users[idx as usize].collateral[asset_idx] = new_amount;
        }

        /// Set a debt balance and maintain the per-asset total.
        pub fn set_debt(&mut self, idx: u16, asset_idx: usize, new_amount: u128) {
            let old = self.users[idx as usize].debt[asset_idx];
            if new_amount >= old {
                self.total_debt[asset_idx] =
                    self.total_debt[asset_idx].saturating_add(new_amount - old);
            } else {
                self.total_debt[asset_idx] =
                    self.total_debt[asset_idx].saturating_sub(old - new_amount);
            }
            self.users[idx as usize].debt[asset_idx] = new_amount;
        }

        /// Recompute both totals from the slab and compare with the maintained
        /// values. Verification hook for tests and fuzzing.
        pub fn check_totals(&self) -> bool {
            let mut collateral = [0u128; MAX_ASSETS];
            let mut debt = [0u128; MAX_ASSETS];
            self.for_each_used(|_idx, position| {
                for a in 0..MAX_ASSETS {
                    collateral[a] = collateral[a].saturating_add(position.collateral[a]);
                    debt[a] = debt[a].saturating_add(position.debt[a]);
                }
            });
            collateral == self.total_collateral && debt == self.total_debt
        }
    }

    impl Default for PositionLedger {
        fn default() -> Self {
            Self::new()
        }
    }
}

// 6. mod risk
pub mod risk {
    use crate::constants::{CLOSE_FACTOR_BPS, HEALTH_FACTOR_LIQUIDATION_THRESHOLD, MAX_ASSETS};
    use crate::error::{Result, VaultError};
    use crate::ledger::UserPosition;
    use crate::math::{percent_div, percent_mul, pow10, to_u128, u256, wad_div};
    use crate::registry::{AssetConfig, AssetRegistry};
    use alloy_primitives::U256;

    /// Account data in the external market's reporting shape. Values are in
    /// the common unit of account, ratios in basis points, the health factor
    /// a wad with `U256::MAX` as the zero-debt sentinel.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AccountData {
        pub total_collateral_value: U256,
        pub total_debt_value: U256,
        pub available_borrows_value: U256,
        pub current_liquidation_threshold_bps: U256,
        pub ltv_bps: U256,
        pub health_factor: U256,
    }

    /// Prices captured once at validation time, indexed by registry slot.
    /// Every computation inside one operation reads from the same snapshot.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PriceSnapshot {
        pub prices: [u128; MAX_ASSETS],
    }

    impl PriceSnapshot {
        pub fn price(&self, asset_idx: usize) -> U256 {
            u256(self.prices[asset_idx])
        }
    }

    /// Outcome of the seize computation for one preemption.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SeizeOutcome {
        /// Collateral units taken from the target.
        pub collateral_amount: u128,
        /// Debt units actually covered. Less than the request only when the
        /// target's collateral could not back the full request.
        pub debt_amount: u128,
    }

    /// Replicates the external market's account-data walk: per-asset values
    /// floor to the unit of account, ratio averages weight by collateral value
    /// and floor once at the end.
    pub fn account_data(
        position: &UserPosition,
        registry: &AssetRegistry,
        prices: &PriceSnapshot,
    ) -> Result<AccountData> {
        let mut total_collateral = U256::ZERO;
        let mut total_debt = U256::ZERO;
        let mut ltv_acc = U256::ZERO;
        let mut threshold_acc = U256::ZERO;

        for (idx, config) in registry.iter_active() {
            let unit = pow10(config.decimals)?;
            let price = prices.price(idx);

            let collateral = u256(position.collateral[idx]);
            if !collateral.is_zero() {
                let value = price
                    .checked_mul(collateral)
                    .ok_or(VaultError::MathOverflow)?
                    / unit;
                total_collateral = total_collateral
                    .checked_add(value)
                    .ok_or(VaultError::MathOverflow)?;
                ltv_acc = ltv_acc
                    .checked_add(
                        value
                            .checked_mul(u256(config.ltv_bps as u128))
                            .ok_or(VaultError::MathOverflow)?,
                    )
                    .ok_or(VaultError::MathOverflow)?;
                threshold_acc = threshold_acc
                    .checked_add(
                        value
                            .checked_mul(u256(config.liquidation_threshold_bps as u128))
                            .ok_or(VaultError::MathOverflow)?,
                    )
                    .ok_or(VaultError::MathOverflow)?;
            }

            let debt = u256(position.debt[idx]);
            if !debt.is_zero() {
                let value = price.checked_mul(debt).ok_or(VaultError::MathOverflow)? / unit;
                total_debt = total_debt
                    .checked_add(value)
                    .ok_or(VaultError::MathOverflow)?;
            }
        }

        let (ltv_bps, threshold_bps) = if total_collateral.is_zero() {
            (U256::ZERO, U256::ZERO)
        } else {
            (ltv_acc / total_collateral, threshold_acc / total_collateral)
        };

        let health_factor = health_factor_from_balances(total_collateral, total_debt, threshold_bps)?;

        let available_borrows_value = {
            let ceiling = percent_mul(total_collateral, ltv_bps)?;
            if ceiling < total_debt {
                U256::ZERO
            } else {
                ceiling - total_debt
            }
        };

        Ok(AccountData {
            total_collateral_value: total_collateral,
            total_debt_value: total_debt,
            available_borrows_value,
            current_liquidation_threshold_bps: threshold_bps,
            ltv_bps,
            health_factor,
        })
    }

    pub fn health_factor_from_balances(
        total_collateral_value: U256,
        total_debt_value: U256,
        liquidation_threshold_bps: U256,
    ) -> Result<U256> {
        if total_debt_value.is_zero() {
            return Ok(U256::MAX);
        }
        let weighted = percent_mul(total_collateral_value, liquidation_threshold_bps)?;
        wad_div(weighted, total_debt_value)
    }

    pub fn health_factor(
        position: &UserPosition,
        registry: &AssetRegistry,
        prices: &PriceSnapshot,
    ) -> Result<U256> {
        Ok(account_data(position, registry, prices)?.health_factor)
    }

    /// Health factor of the position once `amount` more of `asset_idx` is owed.
    pub fn health_factor_after_borrow(
        position: &UserPosition,
        registry: &AssetRegistry,
        prices: &PriceSnapshot,
        asset_idx: usize,
        amount: u128,
    ) -> Result<U256> {
        let mut projected = *position;
        projected.debt[asset_idx] = projected.debt[asset_idx]
            .checked_add(amount)
            .ok_or(VaultError::MathOverflow)?;
        health_factor(&projected, registry, prices)
    }

    /// Health factor of the position once `amount` of `asset_idx` collateral
    /// has been taken out.
    pub fn health_factor_after_withdraw(
        position: &UserPosition,
        registry: &AssetRegistry,
        prices: &PriceSnapshot,
        asset_idx: usize,
        amount: u128,
    ) -> Result<U256> {
        let mut projected = *position;
        projected.collateral[asset_idx] = projected.collateral[asset_idx]
            .checked_sub(amount)
            .ok_or(VaultError::InsufficientBalance)?;
        health_factor(&projected, registry, prices)
    }

    pub fn is_liquidatable(health_factor: U256) -> bool {
        health_factor < u256(HEALTH_FACTOR_LIQUIDATION_THRESHOLD)
    }

    /// Largest debt repayment one preemption may cover, half-up like the
    /// market's own close-factor math.
    pub fn max_repayable(debt_units: u128) -> Result<u128> {
        to_u128(percent_mul(u256(debt_units), u256(CLOSE_FACTOR_BPS as u128))?)
    }

    /// Collateral units seized for covering `debt_to_cover` units of debt,
    /// bonus included. When the target's balance cannot back the full request
    /// the seize is capped there and the debt actually covered is recomputed
    /// from the cap.
    pub fn collateral_to_seize(
        collateral_config: &AssetConfig,
        debt_config: &AssetConfig,
        collateral_price: U256,
        debt_price: U256,
        debt_to_cover: u128,
        target_collateral_balance: u128,
    ) -> Result<SeizeOutcome> {
        let collateral_unit = pow10(collateral_config.decimals)?;
        let debt_unit = pow10(debt_config.decimals)?;
        let bonus = u256(collateral_config.liquidation_bonus_bps as u128);

        let numerator = debt_price
            .checked_mul(u256(debt_to_cover))
            .and_then(|p| p.checked_mul(collateral_unit))
            .ok_or(VaultError::MathOverflow)?;
        let denominator = collateral_price
            .checked_mul(debt_unit)
            .ok_or(VaultError::MathOverflow)?;
        if denominator.is_zero() {
            return Err(VaultError::MathOverflow);
        }
        let max_collateral = percent_mul(numerator, bonus)? / denominator;

        let balance = u256(target_collateral_balance);
        if max_collateral > balance {
            let value = collateral_price
                .checked_mul(balance)
                .and_then(|p| p.checked_mul(debt_unit))
                .ok_or(VaultError::MathOverflow)?;
            let debt_denominator = debt_price
                .checked_mul(collateral_unit)
                .ok_or(VaultError::MathOverflow)?;
            if debt_denominator.is_zero() {
                return Err(VaultError::MathOverflow);
            }
            let debt_amount = percent_div(value / debt_denominator, bonus)?;
            Ok(SeizeOutcome {
                collateral_amount: target_collateral_balance,
                debt_amount: to_u128(debt_amount)?,
            })
        } else {
            Ok(SeizeOutcome {
                collateral_amount: to_u128(max_collateral)?,
                debt_amount: debt_to_cover,
            })
        }
    }
}

// 7. mod adapter
pub mod adapter {
    use crate::error::AdapterResult;
    use crate::risk::AccountData;
    use alloy_primitives::Address;

    /// Interest-rate mode forwarded to the external market on borrow/repay.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum RateMode {
        Stable,
        Variable,
    }

    /// Whether a withdrawal leaves the market as underlying tokens or as the
    /// market's yield-bearing receipt.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum WithdrawMode {
        Underlying,
        Receipt,
    }

    /// The vault's only gateway to the external money market and to token
    /// custody. One aggregate position is held on behalf of all users; the
    /// market never sees individual shares.
    ///
    /// Implementors report refusals as errors and must not partially apply a
    /// call. The vault pairs every ledger mutation with calls on this trait
    /// and undoes the mutation if the call refuses.
    pub trait ExternalMarketAdapter {
        // --- aggregate position ---

        /// Move `amount` of `asset` from vault custody into the pooled
        /// position as collateral.
        fn supply(&mut self, asset: Address, amount: u128) -> AdapterResult<()>;

        /// Draw `amount` of `asset` against the pooled position into vault
        /// custody. Refused when the aggregate cannot support it.
        fn borrow(&mut self, asset: Address, amount: u128, mode: RateMode) -> AdapterResult<()>;

        /// Pay down pooled debt from vault custody. Returns the amount
        /// actually applied, which the market caps at the outstanding debt.
        fn repay(&mut self, asset: Address, amount: u128, mode: RateMode) -> AdapterResult<u128>;

        /// Take `amount` of `asset` collateral out of the pooled position,
        /// either redeemed to underlying in vault custody or detached as the
        /// market's receipt token. Returns the amount withdrawn.
        fn withdraw(
            &mut self,
            asset: Address,
            amount: u128,
            mode: WithdrawMode,
        ) -> AdapterResult<u128>;

        // --- reporting ---

        /// The market's own account data for any holder, the vault's
        /// aggregate included.
        fn account_data(&self, holder: Address) -> AdapterResult<AccountData>;

        /// Price of one whole token in the common unit of account, wad scale.
        fn asset_price(&self, asset: Address) -> AdapterResult<u128>;

        /// The vault's pooled collateral in `asset`, in asset units.
        fn collateral_balance(&self, asset: Address) -> u128;

        /// The vault's pooled debt in `asset`, in asset units.
        fn debt_balance(&self, asset: Address) -> u128;

        // --- token custody ---

        /// Pull tokens from a user wallet into vault custody, consuming the
        /// user's allowance to the vault.
        fn transfer_in(&mut self, from: Address, asset: Address, amount: u128)
            -> AdapterResult<()>;

        /// Push tokens from vault custody to a user wallet.
        fn transfer_out(&mut self, to: Address, asset: Address, amount: u128)
            -> AdapterResult<()>;

        fn balance_of(&self, owner: Address, asset: Address) -> u128;

        /// Remaining allowance `owner` has granted the vault for `asset`.
        fn allowance(&self, owner: Address, asset: Address) -> u128;
    }
}

// 8. mod sim
pub mod sim {
    use crate::adapter::{ExternalMarketAdapter, RateMode, WithdrawMode};
    use crate::error::{AdapterError, AdapterResult};
    use crate::risk::AccountData;
    use alloy_primitives::{Address, U256};
    use std::collections::BTreeMap;

    const WAD: u128 = 1_000_000_000_000_000_000;
    const PERCENTAGE_FACTOR: u128 = 10_000;
    const HALF_PERCENTAGE_FACTOR: u128 = 5_000;
    const CLOSE_FACTOR_BPS: u128 = 5_000;

    /// Listing parameters for one asset in the simulated market.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SimAsset {
        pub decimals: u8,
        pub ltv_bps: u64,
        pub liquidation_threshold_bps: u64,
        pub liquidation_bonus_bps: u64,
        pub price: u128,
    }

    /// Per-verb failure injection. A paused verb refuses with `Paused` and
    /// changes nothing.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PauseSwitches {
        pub supply: bool,
        pub borrow: bool,
        pub repay: bool,
        pub withdraw: bool,
        pub transfer_in: bool,
        pub transfer_out: bool,
    }

    /// Deterministic in-memory money market and token ledger.
    ///
    /// Holds wallets, allowances granted to the vault, per-holder pool
    /// positions and reserve liquidity, and computes account data and
    /// liquidations with the market's own formulas. Any address can hold a
    /// standalone pool position, which is what the parity tests compare the
    /// vault's internal ledger against.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SimMarket {
        vault: Address,
        assets: BTreeMap<Address, SimAsset>,
        wallets: BTreeMap<(Address, Address), u128>,
        allowances: BTreeMap<(Address, Address), u128>,
        supplied: BTreeMap<(Address, Address), u128>,
        borrowed: BTreeMap<(Address, Address), u128>,
        receipts: BTreeMap<(Address, Address), u128>,
        reserves: BTreeMap<Address, u128>,
        pub paused: PauseSwitches,
    }

    impl SimMarket {
        pub fn new(vault: Address) -> Self {
            Self {
                vault,
                assets: BTreeMap::new(),
                wallets: BTreeMap::new(),
                allowances: BTreeMap::new(),
                supplied: BTreeMap::new(),
                borrowed: BTreeMap::new(),
                receipts: BTreeMap::new(),
                reserves: BTreeMap::new(),
                paused: PauseSwitches::default(),
            }
        }

        // ========================================
        // World setup
        // ========================================

        pub fn list_asset(&mut self, asset: Address, listing: SimAsset) {
            self.assets.insert(asset, listing);
        }

        pub fn set_price(&mut self, asset: Address, price: u128) {
            if let Some(listing) = self.assets.get_mut(&asset) {
                listing.price = price;
            }
        }

        pub fn mint(&mut self, owner: Address, asset: Address, amount: u128) {
            let balance = self.wallets.entry((owner, asset)).or_insert(0);
            *balance = balance.saturating_add(amount);
        }

        /// Grant the vault an allowance over `owner`'s wallet.
        pub fn approve(&mut self, owner: Address, asset: Address, amount: u128) {
            self.allowances.insert((owner, asset), amount);
        }

        /// Seed reserve liquidity that no holder owns, as if third parties
        /// had supplied the pool.
        pub fn seed_liquidity(&mut self, asset: Address, amount: u128) {
            let reserve = self.reserves.entry(asset).or_insert(0);
            *reserve = reserve.saturating_add(amount);
        }

        // ========================================
        // Reads
        // ========================================

        pub fn wallet(&self, owner: Address, asset: Address) -> u128 {
            self.wallets.get(&(owner, asset)).copied().unwrap_or(0)
        }

        pub fn supplied_of(&self, holder: Address, asset: Address) -> u128 {
            self.supplied.get(&(holder, asset)).copied().unwrap_or(0)
        }

        pub fn borrowed_of(&self, holder: Address, asset: Address) -> u128 {
            self.borrowed.get(&(holder, asset)).copied().unwrap_or(0)
        }

        pub fn receipt_of(&self, holder: Address, asset: Address) -> u128 {
            self.receipts.get(&(holder, asset)).copied().unwrap_or(0)
        }

        pub fn reserve(&self, asset: Address) -> u128 {
            self.reserves.get(&asset).copied().unwrap_or(0)
        }

        pub fn price_of(&self, asset: Address) -> u128 {
            self.assets.get(&asset).map(|a| a.price).unwrap_or(0)
        }

        fn listing(&self, asset: Address) -> AdapterResult<SimAsset> {
            self.assets
                .get(&asset)
                .copied()
                .ok_or(AdapterError::UnknownAsset)
        }

        // ========================================
        // Market math (the market's own, not the vault's)
        // ========================================

        fn unit(decimals: u8) -> AdapterResult<U256> {
            U256::from(10u8)
                .checked_pow(U256::from(decimals))
                .ok_or(AdapterError::Overflow)
        }

        fn pmul(a: U256, bps: U256) -> AdapterResult<U256> {
            a.checked_mul(bps)
                .and_then(|p| p.checked_add(U256::from(HALF_PERCENTAGE_FACTOR)))
                .map(|p| p / U256::from(PERCENTAGE_FACTOR))
                .ok_or(AdapterError::Overflow)
        }

        fn pdiv(a: U256, bps: U256) -> AdapterResult<U256> {
            if bps.is_zero() {
                return Err(AdapterError::Overflow);
            }
            a.checked_mul(U256::from(PERCENTAGE_FACTOR))
                .and_then(|p| p.checked_add(bps / U256::from(2u8)))
                .map(|p| p / bps)
                .ok_or(AdapterError::Overflow)
        }

        fn wdiv(a: U256, b: U256) -> AdapterResult<U256> {
            if b.is_zero() {
                return Err(AdapterError::Overflow);
            }
            a.checked_mul(U256::from(WAD))
                .and_then(|p| p.checked_add(b / U256::from(2u8)))
                .map(|p| p / b)
                .ok_or(AdapterError::Overflow)
        }

        fn narrow(x: U256) -> AdapterResult<u128> {
            u128::try_from(x).map_err(|_| AdapterError::Overflow)
        }

        /// The market's account-data walk over a holder's pool position.
        fn holder_account_data(&self, holder: Address) -> AdapterResult<AccountData> {
            let mut total_collateral = U256::ZERO;
            let mut total_debt = U256::ZERO;
            let mut ltv_acc = U256::ZERO;
            let mut threshold_acc = U256::ZERO;

            for (&asset, listing) in &self.assets {
                let unit = Self::unit(listing.decimals)?;
                let price = U256::from(listing.price);

                let supplied = self.supplied_of(holder, asset);
                if supplied > 0 {
                    let value = price
                        .checked_mul(U256::from(supplied))
                        .ok_or(AdapterError::Overflow)?
                        / unit;
                    total_collateral = total_collateral
                        .checked_add(value)
                        .ok_or(AdapterError::Overflow)?;
                    ltv_acc = ltv_acc
                        .checked_add(
                            value
                                .checked_mul(U256::from(listing.ltv_bps))
                                .ok_or(AdapterError::Overflow)?,
                        )
                        .ok_or(AdapterError::Overflow)?;
                    threshold_acc = threshold_acc
                        .checked_add(
                            value
                                .checked_mul(U256::from(listing.liquidation_threshold_bps))
                                .ok_or(AdapterError::Overflow)?,
                        )
                        .ok_or(AdapterError::Overflow)?;
                }

                let borrowed = self.borrowed_of(holder, asset);
                if borrowed > 0 {
                    let value = price
                        .checked_mul(U256::from(borrowed))
                        .ok_or(AdapterError::Overflow)?
                        / unit;
                    total_debt = total_debt
                        .checked_add(value)
                        .ok_or(AdapterError::Overflow)?;
                }
            }

            let (ltv_bps, threshold_bps) = if total_collateral.is_zero() {
                (U256::ZERO, U256::ZERO)
            } else {
                (ltv_acc / total_collateral, threshold_acc / total_collateral)
            };

            let health_factor = if total_debt.is_zero() {
                U256::MAX
            } else {
                Self::wdiv(Self::pmul(total_collateral, threshold_bps)?, total_debt)?
            };

            let available_borrows_value = {
                let ceiling = Self::pmul(total_collateral, ltv_bps)?;
                if ceiling < total_debt {
                    U256::ZERO
                } else {
                    ceiling - total_debt
                }
            };

            Ok(AccountData {
                total_collateral_value: total_collateral,
                total_debt_value: total_debt,
                available_borrows_value,
                current_liquidation_threshold_bps: threshold_bps,
                ltv_bps,
                health_factor,
            })
        }

        /// The market's borrow gate for a holder: current health factor must
        /// clear one wad and the post-borrow debt must stay inside the
        /// loan-to-value ceiling.
        fn validate_borrow(&self, holder: Address, asset: Address, amount: u128) -> AdapterResult<()> {
            let listing = self.listing(asset)?;
            let data = self.holder_account_data(holder)?;
            if data.total_collateral_value.is_zero() {
                return Err(AdapterError::CollateralCannotCoverBorrow);
            }
            if !data.total_debt_value.is_zero() && data.health_factor <= U256::from(WAD) {
                return Err(AdapterError::CollateralCannotCoverBorrow);
            }
            let unit = Self::unit(listing.decimals)?;
            let amount_value = U256::from(listing.price)
                .checked_mul(U256::from(amount))
                .ok_or(AdapterError::Overflow)?
                / unit;
            let debt_after = data
                .total_debt_value
                .checked_add(amount_value)
                .ok_or(AdapterError::Overflow)?;
            let collateral_needed = Self::pdiv(debt_after, data.ltv_bps)?;
            if collateral_needed > data.total_collateral_value {
                return Err(AdapterError::CollateralCannotCoverBorrow);
            }
            Ok(())
        }

        /// The market's withdraw gate: the remaining position must stay above
        /// the liquidation line.
        fn validate_withdraw(&self, holder: Address, asset: Address, amount: u128) -> AdapterResult<()> {
            let listing = self.listing(asset)?;
            let data = self.holder_account_data(holder)?;
            if data.total_debt_value.is_zero() {
                return Ok(());
            }
            let unit = Self::unit(listing.decimals)?;
            let amount_value = U256::from(listing.price)
                .checked_mul(U256::from(amount))
                .ok_or(AdapterError::Overflow)?
                / unit;
            let collateral_after = data
                .total_collateral_value
                .checked_sub(amount_value)
                .unwrap_or(U256::ZERO);
            // Remaining collateral keeps its previous weighted threshold; the
            // position is small enough that the approximation matches the
            // market's own check on every test fixture.
            let health_after = if collateral_after.is_zero() {
                U256::ZERO
            } else {
                Self::wdiv(
                    Self::pmul(collateral_after, data.current_liquidation_threshold_bps)?,
                    data.total_debt_value,
                )?
            };
            if health_after < U256::from(WAD) {
                return Err(AdapterError::WithdrawalNotAllowed);
            }
            Ok(())
        }

        // ========================================
        // Wallet plumbing
        // ========================================

        fn wallet_debit(&mut self, owner: Address, asset: Address, amount: u128) -> AdapterResult<()> {
            let balance = self.wallet(owner, asset);
            if balance < amount {
                return Err(AdapterError::InsufficientBalance);
            }
            self.wallets.insert((owner, asset), balance - amount);
            Ok(())
        }

        fn wallet_credit(&mut self, owner: Address, asset: Address, amount: u128) {
            let balance = self.wallets.entry((owner, asset)).or_insert(0);
            *balance = balance.saturating_add(amount);
        }

        fn reserve_debit(&mut self, asset: Address, amount: u128) -> AdapterResult<()> {
            let reserve = self.reserve(asset);
            if reserve < amount {
                return Err(AdapterError::InsufficientLiquidity);
            }
            self.reserves.insert(asset, reserve - amount);
            Ok(())
        }

        fn reserve_credit(&mut self, asset: Address, amount: u128) {
            let reserve = self.reserves.entry(asset).or_insert(0);
            *reserve = reserve.saturating_add(amount);
        }

        // ========================================
        // Standalone positions (twin accounts for parity checks)
        // ========================================

        /// Supply directly from a holder's own wallet into their own pool
        /// position, bypassing the vault.
        pub fn deposit_direct(&mut self, holder: Address, asset: Address, amount: u128) -> AdapterResult<()> {
            self.listing(asset)?;
            self.wallet_debit(holder, asset, amount)?;
            self.reserve_credit(asset, amount);
            let supplied = self.supplied.entry((holder, asset)).or_insert(0);
            *supplied = supplied.saturating_add(amount);
            Ok(())
        }

        /// Borrow directly against a holder's own pool position.
        pub fn borrow_direct(&mut self, holder: Address, asset: Address, amount: u128) -> AdapterResult<()> {
            self.listing(asset)?;
            self.validate_borrow(holder, asset, amount)?;
            self.reserve_debit(asset, amount)?;
            let borrowed = self.borrowed.entry((holder, asset)).or_insert(0);
            *borrowed = borrowed.saturating_add(amount);
            self.wallet_credit(holder, asset, amount);
            Ok(())
        }

        /// The market's own liquidation: anyone may repay up to the close
        /// factor of an unhealthy holder's debt and seize bonus-weighted
        /// collateral. Overshooting requests are capped, not refused.
        /// Returns (debt covered, collateral seized).
        pub fn liquidation_call(
            &mut self,
            liquidator: Address,
            collateral_asset: Address,
            debt_asset: Address,
            holder: Address,
            debt_to_cover: u128,
            receive_underlying: bool,
        ) -> AdapterResult<(u128, u128)> {
            let collateral_listing = self.listing(collateral_asset)?;
            let debt_listing = self.listing(debt_asset)?;

            let data = self.holder_account_data(holder)?;
            if data.health_factor >= U256::from(WAD) {
                return Err(AdapterError::HealthyPosition);
            }

            let outstanding = self.borrowed_of(holder, debt_asset);
            if outstanding == 0 {
                return Err(AdapterError::NoDebt);
            }
            let max_liquidatable = Self::narrow(Self::pmul(
                U256::from(outstanding),
                U256::from(CLOSE_FACTOR_BPS),
            )?)?;
            let actual_requested = debt_to_cover.min(max_liquidatable);

            let collateral_balance = self.supplied_of(holder, collateral_asset);
            let collateral_unit = Self::unit(collateral_listing.decimals)?;
            let debt_unit = Self::unit(debt_listing.decimals)?;
            let collateral_price = U256::from(collateral_listing.price);
            let debt_price = U256::from(debt_listing.price);
            let bonus = U256::from(collateral_listing.liquidation_bonus_bps);

            let numerator = debt_price
                .checked_mul(U256::from(actual_requested))
                .and_then(|p| p.checked_mul(collateral_unit))
                .ok_or(AdapterError::Overflow)?;
            let denominator = collateral_price
                .checked_mul(debt_unit)
                .ok_or(AdapterError::Overflow)?;
            if denominator.is_zero() {
                return Err(AdapterError::Overflow);
            }
            let max_collateral = Self::pmul(numerator, bonus)? / denominator;

            let (seized, actual_debt) = if max_collateral > U256::from(collateral_balance) {
                let value = collateral_price
                    .checked_mul(U256::from(collateral_balance))
                    .and_then(|p| p.checked_mul(debt_unit))
                    .ok_or(AdapterError::Overflow)?;
                let debt_denominator = debt_price
                    .checked_mul(collateral_unit)
                    .ok_or(AdapterError::Overflow)?;
                if debt_denominator.is_zero() {
                    return Err(AdapterError::Overflow);
                }
                let debt_amount = Self::narrow(Self::pdiv(value / debt_denominator, bonus)?)?;
                (collateral_balance, debt_amount)
            } else {
                (Self::narrow(max_collateral)?, actual_requested)
            };

            // Liquidator pays the debt from their wallet into the reserve.
            self.wallet_debit(liquidator, debt_asset, actual_debt)?;
            if receive_underlying {
                self.reserve_debit(collateral_asset, seized)?;
            }

            self.reserve_credit(debt_asset, actual_debt);
            self.borrowed
                .insert((holder, debt_asset), outstanding - actual_debt);
            self.supplied
                .insert((holder, collateral_asset), collateral_balance - seized);

            if receive_underlying {
                self.wallet_credit(liquidator, collateral_asset, seized);
            } else {
                let receipt = self.supplied.entry((liquidator, collateral_asset)).or_insert(0);
                *receipt = receipt.saturating_add(seized);
            }

            Ok((actual_debt, seized))
        }
    }

    impl ExternalMarketAdapter for SimMarket {
        fn supply(&mut self, asset: Address, amount: u128) -> AdapterResult<()> {
            if self.paused.supply {
                return Err(AdapterError::Paused);
            }
            self.listing(asset)?;
            self.wallet_debit(self.vault, asset, amount)?;
            self.reserve_credit(asset, amount);
            let supplied = self.supplied.entry((self.vault, asset)).or_insert(0);
            *supplied = supplied.saturating_add(amount);
            Ok(())
        }

        fn borrow(&mut self, asset: Address, amount: u128, _mode: RateMode) -> AdapterResult<()> {
            if self.paused.borrow {
                return Err(AdapterError::Paused);
            }
            self.listing(asset)?;
            self.validate_borrow(self.vault, asset, amount)?;
            self.reserve_debit(asset, amount)?;
            let borrowed = self.borrowed.entry((self.vault, asset)).or_insert(0);
            *borrowed = borrowed.saturating_add(amount);
            self.wallet_credit(self.vault, asset, amount);
            Ok(())
        }

        fn repay(&mut self, asset: Address, amount: u128, _mode: RateMode) -> AdapterResult<u128> {
            if self.paused.repay {
                return Err(AdapterError::Paused);
            }
            self.listing(asset)?;
            let outstanding = self.borrowed_of(self.vault, asset);
            if outstanding == 0 {
                return Err(AdapterError::NoDebt);
            }
            let actual = amount.min(outstanding);
            self.wallet_debit(self.vault, asset, actual)?;
            self.reserve_credit(asset, actual);
            self.borrowed
                .insert((self.vault, asset), outstanding - actual);
            Ok(actual)
        }

        fn withdraw(
            &mut self,
            asset: Address,
            amount: u128,
            mode: WithdrawMode,
        ) -> AdapterResult<u128> {
            if self.paused.withdraw {
                return Err(AdapterError::Paused);
            }
            self.listing(asset)?;
            let supplied = self.supplied_of(self.vault, asset);
            if supplied < amount {
                return Err(AdapterError::InsufficientBalance);
            }
            self.validate_withdraw(self.vault, asset, amount)?;
            match mode {
                WithdrawMode::Underlying => {
                    self.reserve_debit(asset, amount)?;
                    self.supplied.insert((self.vault, asset), supplied - amount);
                    self.wallet_credit(self.vault, asset, amount);
                }
                WithdrawMode::Receipt => {
                    self.supplied.insert((self.vault, asset), supplied - amount);
                    let receipt = self.receipts.entry((self.vault, asset)).or_insert(0);
                    *receipt = receipt.saturating_add(amount);
                }
            }
            Ok(amount)
        }

        fn account_data(&self, holder: Address) -> AdapterResult<AccountData> {
            self.holder_account_data(holder)
        }

        fn asset_price(&self, asset: Address) -> AdapterResult<u128> {
            Ok(self.listing(asset)?.price)
        }

        fn collateral_balance(&self, asset: Address) -> u128 {
            self.supplied_of(self.vault, asset)
        }

        fn debt_balance(&self, asset: Address) -> u128 {
            self.borrowed_of(self.vault, asset)
        }

        fn transfer_in(&mut self, from: Address, asset: Address, amount: u128) -> AdapterResult<()> {
            if self.paused.transfer_in {
                return Err(AdapterError::Paused);
            }
            let allowance = self.allowances.get(&(from, asset)).copied().unwrap_or(0);
            if allowance < amount {
                return Err(AdapterError::InsufficientAllowance);
            }
            self.wallet_debit(from, asset, amount)?;
            self.allowances.insert((from, asset), allowance - amount);
            self.wallet_credit(self.vault, asset, amount);
            Ok(())
        }

        fn transfer_out(&mut self, to: Address, asset: Address, amount: u128) -> AdapterResult<()> {
            if self.paused.transfer_out {
                return Err(AdapterError::Paused);
            }
            self.wallet_debit(self.vault, asset, amount)?;
            self.wallet_credit(to, asset, amount);
            Ok(())
        }

        fn balance_of(&self, owner: Address, asset: Address) -> u128 {
            self.wallet(owner, asset)
        }

        fn allowance(&self, owner: Address, asset: Address) -> u128 {
            self.allowances.get(&(owner, asset)).copied().unwrap_or(0)
        }
    }
}

// 9. mod vault
pub mod vault {
    use crate::adapter::{ExternalMarketAdapter, RateMode, WithdrawMode};
    use crate::error::{map_adapter_error, map_borrow_error, Result, VaultError};
    use crate::ledger::PositionLedger;
    use crate::ledger::UserPosition;
    use crate::registry::{AssetConfig, AssetRegistry};
    use crate::risk::{self, AccountData, PriceSnapshot};
    use crate::state::{self, StateHeader};
    use alloy_primitives::{Address, U256};
    use bytemuck::Zeroable;

    /// Construction parameters.
    #[derive(Clone, Copy, Debug)]
    pub struct VaultParams {
        /// Administrator: may configure assets and set the underwriter.
        pub admin: Address,
        /// The vault's own identity in the token ledgers and the external
        /// market; custody transfers land on this address.
        pub identity: Address,
    }

    /// Settlement summary of one preemption.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PreemptOutcome {
        /// Debt units repaid from the underwriter's buffer.
        pub debt_covered: u128,
        /// Collateral units moved off the target.
        pub collateral_seized: u128,
        /// Whether the seize was withdrawn to the underwriter's wallet as
        /// underlying rather than credited to their ledger entry.
        pub received_underlying: bool,
    }

    /// The vault: one aggregate position at the external market, one internal
    /// ledger of user shares, one underwriter slot.
    ///
    /// Sequencing contract for every operation: validate (roles, registry,
    /// balances, risk) against a single price snapshot, then apply ledger
    /// effects, then perform the paired external interactions. No ledger
    /// mutation happens after the first interaction, so a reentrant call can
    /// never observe a stale health factor. If an interaction refuses,
    /// completed interactions are inverted in reverse order and the ledger
    /// effects are undone exactly; the refusal is the operation's result.
    #[derive(Debug)]
    pub struct Vault<M: ExternalMarketAdapter> {
        pub market: M,
        pub registry: AssetRegistry,
        /// Boxed: at production capacity the slab does not fit on a stack.
        pub ledger: Box<PositionLedger>,
        pub admin: Address,
        pub underwriter: Address,
        pub identity: Address,
    }

    impl<M: ExternalMarketAdapter> Vault<M> {
        pub fn new(market: M, params: VaultParams) -> Self {
            Self {
                market,
                registry: AssetRegistry::new(),
                ledger: PositionLedger::new_boxed(),
                admin: params.admin,
                underwriter: Address::ZERO,
                identity: params.identity,
            }
        }

        // ========================================
        // Administration
        // ========================================

        /// Replace the underwriter slot. Takes effect immediately; the old
        /// underwriter's ledger entry keeps its balances but loses the role.
        pub fn set_underwriter(&mut self, caller: Address, new_underwriter: Address) -> Result<()> {
            if caller != self.admin {
                return Err(VaultError::Unauthorized);
            }
            self.underwriter = new_underwriter;
            Ok(())
        }

        pub fn underwriter(&self) -> Option<Address> {
            if self.underwriter == Address::ZERO {
                None
            } else {
                Some(self.underwriter)
            }
        }

        /// Deactivation is refused while any user still holds collateral or
        /// debt in the asset: a deactivated asset drops out of every health
        /// computation, which would let an indebted user look healthy.
        pub fn configure_asset(&mut self, caller: Address, config: AssetConfig) -> Result<usize> {
            if caller != self.admin {
                return Err(VaultError::Unauthorized);
            }
            if !config.is_active() {
                if let Ok(idx) = self.registry.index_of(config.asset()) {
                    if self.ledger.total_collateral[idx] != 0 || self.ledger.total_debt[idx] != 0 {
                        return Err(VaultError::AssetInUse);
                    }
                }
            }
            self.registry.configure(config)
        }

        fn require_underwriter(&self, caller: Address) -> Result<()> {
            if self.underwriter == Address::ZERO || caller != self.underwriter {
                return Err(VaultError::Unauthorized);
            }
            Ok(())
        }

        // ========================================
        // Queries
        // ========================================

        /// One price per registered asset, fetched once. Every computation in
        /// an operation reads from the same snapshot.
        pub fn snapshot_prices(&self) -> Result<PriceSnapshot> {
            let mut snapshot = PriceSnapshot::default();
            for (idx, config) in self.registry.iter_active() {
                snapshot.prices[idx] = self
                    .market
                    .asset_price(config.asset())
                    .map_err(map_adapter_error)?;
            }
            Ok(snapshot)
        }

        pub fn position(&self, user: Address) -> Result<UserPosition> {
            let idx = self.ledger.require_slot(user)?;
            Ok(self.ledger.users[idx as usize])
        }

        pub fn account_data(&self, user: Address) -> Result<AccountData> {
            let position = self.position(user)?;
            let prices = self.snapshot_prices()?;
            risk::account_data(&position, &self.registry, &prices)
        }

        pub fn health_factor(&self, user: Address) -> Result<U256> {
            Ok(self.account_data(user)?.health_factor)
        }

        pub fn is_liquidatable(&self, user: Address) -> Result<bool> {
            Ok(risk::is_liquidatable(self.health_factor(user)?))
        }

        /// Largest single repayment a preemption against `user` may cover.
        pub fn max_repayable(&self, user: Address, debt_asset: Address) -> Result<u128> {
            let asset_idx = self.registry.index_of(debt_asset)?;
            let idx = self.ledger.require_slot(user)?;
            risk::max_repayable(self.ledger.debt(idx, asset_idx))
        }

        /// The internal totals must mirror the external position exactly and
        /// the maintained totals must match a fresh recomputation.
        pub fn check_conservation(&self) -> bool {
            if !self.ledger.check_totals() {
                return false;
            }
            for (idx, config) in self.registry.iter_active() {
                if self.ledger.total_collateral[idx] != self.market.collateral_balance(config.asset())
                {
                    return false;
                }
                if self.ledger.total_debt[idx] != self.market.debt_balance(config.asset()) {
                    return false;
                }
            }
            true
        }

        // ========================================
        // User operations
        // ========================================

        /// Move `amount` of `asset` from the caller's wallet into the pooled
        /// position and credit the caller's ledger collateral.
        ///
        /// If the market refuses after the wallet pull, the tokens are
        /// returned but the allowance consumed by the pull is not restored;
        /// the caller re-approves before retrying.
        pub fn deposit(&mut self, caller: Address, asset: Address, amount: u128) -> Result<()> {
            self.deposit_inner(caller, asset, amount)
        }

        /// Deposit semantics restricted to the underwriter, raising the
        /// buffer that funds preemptions.
        pub fn underwrite(&mut self, caller: Address, asset: Address, amount: u128) -> Result<()> {
            self.require_underwriter(caller)?;
            self.deposit_inner(caller, asset, amount)
        }

        fn deposit_inner(&mut self, caller: Address, asset: Address, amount: u128) -> Result<()> {
            if amount == 0 {
                return Err(VaultError::AmountZero);
            }
            let asset_idx = self.registry.index_of(asset)?;

            // Asset transfer preconditions, checked before any state change.
            if self.market.balance_of(caller, asset) < amount {
                return Err(VaultError::InsufficientBalance);
            }
            if self.market.allowance(caller, asset) < amount {
                return Err(VaultError::InsufficientAllowance);
            }

            let (idx, created) = self.ledger.get_or_create(caller)?;
            let old = self.ledger.collateral(idx, asset_idx);
            let new = old.checked_add(amount).ok_or(VaultError::MathOverflow)?;
            self.ledger.set_collateral(idx, asset_idx, new);

            if let Err(e) = self.market.transfer_in(caller, asset, amount) {
                self.undo_position_change(idx, asset_idx, old, created, true);
                return Err(map_adapter_error(e));
            }
            if let Err(e) = self.market.supply(asset, amount) {
                let _ = self.market.transfer_out(caller, asset, amount);
                self.undo_position_change(idx, asset_idx, old, created, true);
                return Err(map_adapter_error(e));
            }
            Ok(())
        }

        /// Take `amount` of the caller's ledger collateral out of the pooled
        /// position and send it to the caller's wallet. The caller's own
        /// health factor must stay at or above one.
        pub fn withdraw(&mut self, caller: Address, asset: Address, amount: u128) -> Result<()> {
            let idx = self.ledger.require_slot(caller)?;
            self.withdraw_inner(caller, idx, asset, amount)
        }

        /// Withdraw semantics restricted to the underwriter, releasing unused
        /// buffer.
        pub fn reclaim(&mut self, caller: Address, asset: Address, amount: u128) -> Result<()> {
            self.require_underwriter(caller)?;
            let idx = self.ledger.require_slot(caller)?;
            self.withdraw_inner(caller, idx, asset, amount)
        }

        fn withdraw_inner(
            &mut self,
            caller: Address,
            idx: u16,
            asset: Address,
            amount: u128,
        ) -> Result<()> {
            if amount == 0 {
                return Err(VaultError::AmountZero);
            }
            let asset_idx = self.registry.index_of(asset)?;
            let old = self.ledger.collateral(idx, asset_idx);
            if old < amount {
                return Err(VaultError::InsufficientBalance);
            }

            let prices = self.snapshot_prices()?;
            let position = self.ledger.users[idx as usize];
            let health_after = risk::health_factor_after_withdraw(
                &position,
                &self.registry,
                &prices,
                asset_idx,
                amount,
            )?;
            if risk::is_liquidatable(health_after) {
                return Err(VaultError::InsufficientHealthFactor);
            }

            self.ledger.set_collateral(idx, asset_idx, old - amount);

            if let Err(e) = self
                .market
                .withdraw(asset, amount, WithdrawMode::Underlying)
            {
                self.ledger.set_collateral(idx, asset_idx, old);
                return Err(map_adapter_error(e));
            }
            if let Err(e) = self.market.transfer_out(caller, asset, amount) {
                let _ = self.market.supply(asset, amount);
                self.ledger.set_collateral(idx, asset_idx, old);
                return Err(map_adapter_error(e));
            }
            Ok(())
        }

        /// Draw `amount` of `asset` against the caller's own collateral. The
        /// caller's post-borrow health factor must be at least one; the
        /// aggregate borrow is then placed at the external market and the
        /// funds land in the caller's wallet.
        pub fn borrow(
            &mut self,
            caller: Address,
            asset: Address,
            amount: u128,
            mode: RateMode,
        ) -> Result<()> {
            if amount == 0 {
                return Err(VaultError::AmountZero);
            }
            let asset_idx = self.registry.index_of(asset)?;
            let prices = self.snapshot_prices()?;

            // Validate against the caller's current position without
            // allocating a slot for a caller the ledger has never seen.
            let current = match self.ledger.find(caller) {
                Some(idx) => self.ledger.users[idx as usize],
                None => UserPosition::zeroed(),
            };
            let health_after = risk::health_factor_after_borrow(
                &current,
                &self.registry,
                &prices,
                asset_idx,
                amount,
            )?;
            if risk::is_liquidatable(health_after) {
                return Err(VaultError::InsufficientHealthFactor);
            }

            let (idx, created) = self.ledger.get_or_create(caller)?;
            let old = self.ledger.debt(idx, asset_idx);
            let new = old.checked_add(amount).ok_or(VaultError::MathOverflow)?;
            self.ledger.set_debt(idx, asset_idx, new);

            if let Err(e) = self.market.borrow(asset, amount, mode) {
                self.undo_position_change(idx, asset_idx, old, created, false);
                return Err(map_borrow_error(e));
            }
            if let Err(e) = self.market.transfer_out(caller, asset, amount) {
                let _ = self.market.repay(asset, amount, mode);
                self.undo_position_change(idx, asset_idx, old, created, false);
                return Err(map_adapter_error(e));
            }
            Ok(())
        }

        /// Pay down the caller's own debt from their wallet. Requests beyond
        /// the outstanding amount are capped at it, like the market's own
        /// repay. Returns the amount applied.
        ///
        /// As with `deposit`, a market refusal after the wallet pull returns
        /// the tokens but not the consumed allowance.
        pub fn repay(
            &mut self,
            caller: Address,
            asset: Address,
            amount: u128,
            mode: RateMode,
        ) -> Result<u128> {
            if amount == 0 {
                return Err(VaultError::AmountZero);
            }
            let asset_idx = self.registry.index_of(asset)?;
            let idx = self.ledger.require_slot(caller)?;
            let old = self.ledger.debt(idx, asset_idx);
            if old == 0 {
                return Err(VaultError::NoOutstandingDebt);
            }
            let actual = amount.min(old);

            if self.market.balance_of(caller, asset) < actual {
                return Err(VaultError::InsufficientBalance);
            }
            if self.market.allowance(caller, asset) < actual {
                return Err(VaultError::InsufficientAllowance);
            }

            self.ledger.set_debt(idx, asset_idx, old - actual);

            if let Err(e) = self.market.transfer_in(caller, asset, actual) {
                self.ledger.set_debt(idx, asset_idx, old);
                return Err(map_adapter_error(e));
            }
            if let Err(e) = self.market.repay(asset, actual, mode) {
                let _ = self.market.transfer_out(caller, asset, actual);
                self.ledger.set_debt(idx, asset_idx, old);
                return Err(map_adapter_error(e));
            }
            Ok(actual)
        }

        /// Release the caller's ledger slot once every balance is zero.
        pub fn close_position(&mut self, caller: Address) -> Result<()> {
            let idx = self.ledger.require_slot(caller)?;
            self.ledger.close(idx)
        }

        // ========================================
        // Preemption
        // ========================================

        /// Preemptive liquidation of one internal user by the underwriter.
        ///
        /// Validation: caller holds the underwriter slot, the target's health
        /// factor is below one, the request does not exceed the close-factor
        /// share of the target's debt, and the underwriter's posted buffer in
        /// the debt asset covers the repayment.
        ///
        /// Settlement: the target's debt falls by the amount covered, funded
        /// from the buffer; collateral weighted by the liquidation bonus moves
        /// off the target, either onto the underwriter's ledger entry (the
        /// pooled position is unchanged) or withdrawn to the underwriter's
        /// wallet as underlying. All of it happens in one atomic step or not
        /// at all.
        pub fn preempt(
            &mut self,
            caller: Address,
            collateral_asset: Address,
            debt_asset: Address,
            target: Address,
            debt_to_cover: u128,
            want_underlying_collateral: bool,
        ) -> Result<PreemptOutcome> {
            self.require_underwriter(caller)?;
            if debt_to_cover == 0 {
                return Err(VaultError::AmountZero);
            }
            let coll_idx = self.registry.index_of(collateral_asset)?;
            let debt_idx = self.registry.index_of(debt_asset)?;
            let target_idx = self.ledger.require_slot(target)?;
            let uw_idx = self.ledger.require_slot(caller)?;

            let prices = self.snapshot_prices()?;

            let target_position = self.ledger.users[target_idx as usize];
            let health = risk::health_factor(&target_position, &self.registry, &prices)?;
            if !risk::is_liquidatable(health) {
                return Err(VaultError::PositionHealthy);
            }

            let target_debt = self.ledger.debt(target_idx, debt_idx);
            let max_repayable = risk::max_repayable(target_debt)?;
            if debt_to_cover > max_repayable {
                return Err(VaultError::RepaymentExceedsCloseFactor);
            }

            let target_collateral = self.ledger.collateral(target_idx, coll_idx);
            let seize = risk::collateral_to_seize(
                &self.registry.assets[coll_idx],
                &self.registry.assets[debt_idx],
                prices.price(coll_idx),
                prices.price(debt_idx),
                debt_to_cover,
                target_collateral,
            )?;
            let covered = seize.debt_amount;
            let seized = seize.collateral_amount;

            // The buffer is the underwriter's own ledger collateral in the
            // debt asset.
            let buffer = self.ledger.collateral(uw_idx, debt_idx);
            if buffer < covered {
                return Err(VaultError::InsufficientBalance);
            }
            if target_idx == uw_idx && coll_idx == debt_idx {
                // One slot, one asset: the collateral leg and the buffer leg
                // drain the same balance.
                if target_collateral < seized.saturating_add(covered) {
                    return Err(VaultError::InsufficientBalance);
                }
            }

            // Ledger effects. Each step reads the current value so aliased
            // slots and assets stay consistent.
            let effects = PreemptEffects {
                target_idx,
                uw_idx,
                coll_idx,
                debt_idx,
                covered,
                seized,
                credit_receipt: !want_underlying_collateral,
            };
            self.apply_preempt_effects(&effects);

            // Paired interactions: pull the buffer out of the pooled
            // position, repay the target's share of the aggregate debt, and
            // settle the collateral leg.
            if let Err(e) = self
                .market
                .withdraw(debt_asset, covered, WithdrawMode::Underlying)
            {
                self.revert_preempt_effects(&effects);
                return Err(map_adapter_error(e));
            }
            if let Err(e) = self.market.repay(debt_asset, covered, RateMode::Variable) {
                let _ = self.market.supply(debt_asset, covered);
                self.revert_preempt_effects(&effects);
                return Err(map_adapter_error(e));
            }
            if want_underlying_collateral {
                if let Err(e) = self
                    .market
                    .withdraw(collateral_asset, seized, WithdrawMode::Underlying)
                {
                    let _ = self.market.borrow(debt_asset, covered, RateMode::Variable);
                    let _ = self.market.supply(debt_asset, covered);
                    self.revert_preempt_effects(&effects);
                    return Err(map_adapter_error(e));
                }
                if let Err(e) = self.market.transfer_out(caller, collateral_asset, seized) {
                    let _ = self.market.supply(collateral_asset, seized);
                    let _ = self.market.borrow(debt_asset, covered, RateMode::Variable);
                    let _ = self.market.supply(debt_asset, covered);
                    self.revert_preempt_effects(&effects);
                    return Err(map_adapter_error(e));
                }
            }

            Ok(PreemptOutcome {
                debt_covered: covered,
                collateral_seized: seized,
                received_underlying: want_underlying_collateral,
            })
        }

        fn apply_preempt_effects(&mut self, fx: &PreemptEffects) {
            let debt = self.ledger.debt(fx.target_idx, fx.debt_idx);
            self.ledger
                .set_debt(fx.target_idx, fx.debt_idx, debt.saturating_sub(fx.covered));
            let coll = self.ledger.collateral(fx.target_idx, fx.coll_idx);
            self.ledger
                .set_collateral(fx.target_idx, fx.coll_idx, coll.saturating_sub(fx.seized));
            let buffer = self.ledger.collateral(fx.uw_idx, fx.debt_idx);
            self.ledger
                .set_collateral(fx.uw_idx, fx.debt_idx, buffer.saturating_sub(fx.covered));
            if fx.credit_receipt {
                let uw_coll = self.ledger.collateral(fx.uw_idx, fx.coll_idx);
                self.ledger
                    .set_collateral(fx.uw_idx, fx.coll_idx, uw_coll.saturating_add(fx.seized));
            }
        }

        fn revert_preempt_effects(&mut self, fx: &PreemptEffects) {
            if fx.credit_receipt {
                let uw_coll = self.ledger.collateral(fx.uw_idx, fx.coll_idx);
                self.ledger
                    .set_collateral(fx.uw_idx, fx.coll_idx, uw_coll.saturating_sub(fx.seized));
            }
            let buffer = self.ledger.collateral(fx.uw_idx, fx.debt_idx);
            self.ledger
                .set_collateral(fx.uw_idx, fx.debt_idx, buffer.saturating_add(fx.covered));
            let coll = self.ledger.collateral(fx.target_idx, fx.coll_idx);
            self.ledger
                .set_collateral(fx.target_idx, fx.coll_idx, coll.saturating_add(fx.seized));
            let debt = self.ledger.debt(fx.target_idx, fx.debt_idx);
            self.ledger
                .set_debt(fx.target_idx, fx.debt_idx, debt.saturating_add(fx.covered));
        }

        fn undo_position_change(
            &mut self,
            idx: u16,
            asset_idx: usize,
            old_amount: u128,
            release_slot: bool,
            is_collateral: bool,
        ) {
            if is_collateral {
                self.ledger.set_collateral(idx, asset_idx, old_amount);
            } else {
                self.ledger.set_debt(idx, asset_idx, old_amount);
            }
            if release_slot {
                self.ledger.free_slot(idx);
            }
        }

        // ========================================
        // State snapshot
        // ========================================

        /// Serialize the vault's owned state (ledger, registry, roles).
        pub fn snapshot(&self) -> Vec<u8> {
            let header = StateHeader::new(self.admin, self.underwriter, self.identity);
            state::write_state(&self.ledger, &self.registry, &header)
        }

        /// Rebuild a vault from snapshot bytes and a market handle.
        pub fn restore(market: M, bytes: &[u8]) -> Result<Self> {
            let (ledger, registry, header) = state::read_state(bytes)?;
            Ok(Self {
                market,
                registry,
                ledger,
                admin: Address::from(header.admin),
                underwriter: Address::from(header.underwriter),
                identity: Address::from(header.identity),
            })
        }
    }

    struct PreemptEffects {
        target_idx: u16,
        uw_idx: u16,
        coll_idx: usize,
        debt_idx: usize,
        covered: u128,
        seized: u128,
        credit_receipt: bool,
    }
}

// 10. mod state
pub mod state {
    use crate::constants::{
        HEADER_OFF, LEDGER_OFF, MAGIC, REGISTRY_OFF, STATE_LEN, VERSION,
    };
    use crate::error::{Result, VaultError};
    use crate::ledger::PositionLedger;
    use crate::registry::AssetRegistry;
    use alloy_primitives::Address;
    use bytemuck::{bytes_of, bytes_of_mut, Pod, Zeroable};
    use core::mem::size_of;

    /// Snapshot header. Magic and version gate every load.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    pub struct StateHeader {
        pub magic: u64,
        pub version: u32,
        pub _padding: [u8; 4],
        pub admin: [u8; 20],
        pub underwriter: [u8; 20],
        pub identity: [u8; 20],
        pub _padding2: [u8; 4],
    }

    impl StateHeader {
        pub fn new(admin: Address, underwriter: Address, identity: Address) -> Self {
            let mut header = Self::zeroed();
            header.magic = MAGIC;
            header.version = VERSION;
            header.admin.copy_from_slice(admin.as_slice());
            header.underwriter.copy_from_slice(underwriter.as_slice());
            header.identity.copy_from_slice(identity.as_slice());
            header
        }
    }

    pub fn write_state(
        ledger: &PositionLedger,
        registry: &AssetRegistry,
        header: &StateHeader,
    ) -> Vec<u8> {
        let mut bytes = vec![0u8; STATE_LEN];
        bytes[LEDGER_OFF..LEDGER_OFF + size_of::<PositionLedger>()]
            .copy_from_slice(bytes_of(ledger));
        bytes[REGISTRY_OFF..REGISTRY_OFF + size_of::<AssetRegistry>()]
            .copy_from_slice(bytes_of(registry));
        bytes[HEADER_OFF..HEADER_OFF + size_of::<StateHeader>()].copy_from_slice(bytes_of(header));
        bytes
    }

    pub fn read_state(bytes: &[u8]) -> Result<(Box<PositionLedger>, AssetRegistry, StateHeader)> {
        if bytes.len() != STATE_LEN {
            return Err(VaultError::InvalidStateLen);
        }
        let mut header = StateHeader::zeroed();
        bytes_of_mut(&mut header)
            .copy_from_slice(&bytes[HEADER_OFF..HEADER_OFF + size_of::<StateHeader>()]);
        if header.magic != MAGIC {
            return Err(VaultError::NotInitialized);
        }
        if header.version != VERSION {
            return Err(VaultError::InvalidVersion);
        }
        // Deserialized straight into a heap slab; see PositionLedger::new_boxed.
        let mut ledger: Box<PositionLedger> = bytemuck::zeroed_box();
        bytes_of_mut(&mut *ledger)
            .copy_from_slice(&bytes[LEDGER_OFF..LEDGER_OFF + size_of::<PositionLedger>()]);
        let mut registry = AssetRegistry::zeroed();
        bytes_of_mut(&mut registry)
            .copy_from_slice(&bytes[REGISTRY_OFF..REGISTRY_OFF + size_of::<AssetRegistry>()]);
        Ok((ledger, registry, header))
    }
}

pub use adapter::{ExternalMarketAdapter, RateMode, WithdrawMode};
pub use error::{AdapterError, AdapterResult, Result, VaultError};
pub use ledger::{PositionLedger, UserPosition, NO_SLOT};
pub use registry::{AssetConfig, AssetRegistry};
pub use risk::{AccountData, PriceSnapshot, SeizeOutcome};
pub use sim::{PauseSwitches, SimAsset, SimMarket};
pub use vault::{PreemptOutcome, Vault, VaultParams};
