use rocket::{
    response::stream::{Event, EventStream},
    tokio::select,
    Route, Shutdown, State,
};

use crate::error::Result;
use crate::model::common::BallotId;
use crate::service::BallotService;

pub fn routes() -> Vec<Route> {
    routes![live_results]
}

/// Stream the ballot's vote counts: the current counts first, then a new
/// event every time a vote is recorded. The stream ends when the ballot is
/// deleted or the server shuts down.
#[get("/ballots/<ballot_id>/live-results")]
async fn live_results(
    ballot_id: BallotId,
    service: &State<BallotService>,
    mut shutdown: Shutdown,
) -> Result<EventStream![]> {
    let mut live = service.register_sse_client(&ballot_id).await?;
    Ok(EventStream! {
        loop {
            let tallies = select! {
                tallies = live.next() => match tallies {
                    Some(tallies) => tallies,
                    None => break,
                },
                _ = &mut shutdown => break,
            };
            yield Event::json(&tallies);
        }
    })
}
