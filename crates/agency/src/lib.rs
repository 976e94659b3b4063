//! Agency domain module (event-sourced).
//!
//! An agency is a team of students sharing one budget and one VE score. This
//! crate holds its rule engines as deterministic domain logic (no IO, no
//! clocks, no randomness):
//!
//! - [`settlement`]: weekly revenue, rent, salaries and cost of living.
//! - [`mercato`]: quorum-gated hire/fire/found-agency decisions.
//! - [`black_market`]: priced special actions.
//! - [`agency`]: the aggregate tying them to the event stream.

pub mod agency;
pub mod black_market;
pub mod calendar;
pub mod ledger;
pub mod mercato;
pub mod rules;
pub mod settlement;
pub mod student;

pub use agency::{
    AddMember, Agency, AgencyCommand, AgencyCreated, AgencyEvent, BankruptcyThresholdBreached,
    BlackOpResolved, CastVote, CreateAgency, DeliverableGraded, DeliverableSubmitted,
    DepartureReason, GradeDeliverable, LedgerEntryPosted, MemberJoined, MemberLeft, OpenRequest,
    PostAdjustment, PurchaseBlackOp, ReleaseMember, RemoveMember, RequestOpened, RequestResolved,
    ResolveRequest, SettleWeek, SubmitDeliverable, TransferToAgency, VoteCast, WeekModule,
    WeekSettled, WeekStatus, AGENCY_STREAM_TYPE,
};
pub use black_market::{BlackOpKind, BlackOpOutcome, BlackOpSpec, Effect};
pub use calendar::WeekKey;
pub use ledger::{Books, GameEvent, GameEventKind, ScoreDelta, WalletDelta};
pub use mercato::{
    Decision, MercatoRequest, RequestKind, RequestStatus, ResolutionReason, Tally, Verdict, Vote,
};
pub use rules::{AdjustmentKind, Grade, GradeReward, GradeRewards, GameRules};
pub use settlement::{BankruptcyBreach, Settlement};
pub use student::Student;
