/// The kinds of assets that can be subject to investment. A `Unit` asset
/// is identified by the index of its unit block within the operational
/// model; a `Line` asset by the index of the transmission line within the
/// network blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Unit,
    Line,
}

/// A candidate asset of the investment problem. One decision variable is
/// associated with each asset, in the same order in which the assets are
/// given. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Asset {
    pub kind: AssetKind,
    pub index: usize,
    pub cost: f64,
    pub disinvestment_cost: f64,
    pub installed_quantity: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl Asset {
    pub fn new(
        kind: AssetKind,
        index: usize,
        cost: f64,
        disinvestment_cost: f64,
        installed_quantity: f64,
        lower_bound: f64,
        upper_bound: f64,
    ) -> Self {
        assert!(
            lower_bound <= upper_bound,
            "asset {index}: lower bound {lower_bound} > upper bound {upper_bound}"
        );
        assert!(
            installed_quantity >= 0.0,
            "asset {index}: negative installed quantity {installed_quantity}"
        );
        Self {
            kind,
            index,
            cost,
            disinvestment_cost,
            installed_quantity,
            lower_bound,
            upper_bound,
        }
    }

    /// A unit asset with zero costs, one installed quantity and free
    /// bounds, matching the defaults of the data format.
    pub fn unit(index: usize) -> Self {
        Self::new(
            AssetKind::Unit,
            index,
            0.0,
            0.0,
            1.0,
            f64::NEG_INFINITY,
            f64::INFINITY,
        )
    }

    /// A transmission line asset with zero costs, one installed quantity
    /// and free bounds.
    pub fn line(index: usize) -> Self {
        Self::new(
            AssetKind::Line,
            index,
            0.0,
            0.0,
            1.0,
            f64::NEG_INFINITY,
            f64::INFINITY,
        )
    }

    pub fn with_costs(mut self, cost: f64, disinvestment_cost: f64) -> Self {
        self.cost = cost;
        self.disinvestment_cost = disinvestment_cost;
        self
    }

    pub fn with_installed_quantity(mut self, quantity: f64) -> Self {
        assert!(quantity >= 0.0);
        self.installed_quantity = quantity;
        self
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        assert!(lower <= upper);
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }
}
