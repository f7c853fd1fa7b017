use crate::config::ContractCfg;
use crate::validator::{EventRule, EventValidator};

const NFT_RULES: &[EventRule] = &[
    EventRule {
        name: "Transfer",
        required: &["from", "to", "tokenId"],
    },
    EventRule {
        name: "Approval",
        required: &["owner", "approved", "tokenId"],
    },
    EventRule {
        name: "ApprovalForAll",
        required: &["owner", "operator", "approved"],
    },
];

const AUCTION_RULES: &[EventRule] = &[
    EventRule {
        name: "BidPlaced",
        required: &["bidder", "amount", "auctionId"],
    },
    EventRule {
        name: "AuctionCreated",
        required: &["creator", "auctionId", "startPrice", "duration"],
    },
    EventRule {
        name: "AuctionEnded",
        required: &["auctionId", "winner", "winningBid"],
    },
];

const TRANSACTION_RULES: &[EventRule] = &[
    EventRule {
        name: "TransactionProcessed",
        required: &["txHash", "status"],
    },
    EventRule {
        name: "PaymentReceived",
        required: &["from", "to", "amount", "token"],
    },
    EventRule {
        name: "RefundIssued",
        required: &["to", "amount", "reason"],
    },
];

/// Everything a [`crate::listener::Listener`] needs to know about one
/// monitored contract: validation rules and queue routing. Behavior is a
/// value, not a subclass.
#[derive(Debug, Clone)]
pub struct ContractSpec {
    pub name: String,
    pub address: String,
    pub validator: EventValidator,
    routes: &'static [(&'static str, &'static str)],
}

impl ContractSpec {
    /// Queue that receives every validated event of this contract.
    pub fn events_queue(&self) -> String {
        format!("{}-events", self.name)
    }

    /// Dedicated queue for a specific event type, if one exists.
    pub fn route(&self, event_name: &str) -> Option<&'static str> {
        self.routes
            .iter()
            .find(|(name, _)| *name == event_name)
            .map(|(_, queue)| *queue)
    }

    pub fn supported_events(&self) -> Vec<&'static str> {
        self.validator.known_events()
    }
}

/// Builds the spec for a configured contract. Contracts without a known
/// rule set still get a spec; their validator accepts everything under the
/// unknown-event policy, and only the generic events queue is routed.
pub fn spec_for(cfg: &ContractCfg) -> ContractSpec {
    let (rules, routes): (&'static [EventRule], &'static [(&str, &str)]) = match cfg.name.as_str() {
        "nft" => (
            NFT_RULES,
            &[
                ("Transfer", "nft-transfer-processing"),
                ("Approval", "nft-approval-processing"),
                ("ApprovalForAll", "nft-approval-all-processing"),
            ],
        ),
        "auction" => (
            AUCTION_RULES,
            &[
                ("BidPlaced", "bid-processing"),
                ("AuctionCreated", "auction-creation-processing"),
                ("AuctionEnded", "auction-completion-processing"),
            ],
        ),
        "transaction" => (
            TRANSACTION_RULES,
            &[
                ("TransactionProcessed", "transaction-status-update"),
                ("PaymentReceived", "payment-processing"),
                ("RefundIssued", "refund-processing"),
            ],
        ),
        other => {
            tracing::warn!(contract = other, "no event rules registered for contract");
            (&[], &[])
        }
    };

    ContractSpec {
        name: cfg.name.clone(),
        address: cfg.address.clone(),
        validator: EventValidator::new(cfg.name.clone(), rules),
        routes,
    }
}
