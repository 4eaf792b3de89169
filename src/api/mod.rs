use rocket::Route;

mod ballots;
mod live;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(ballots::routes());
    routes.extend(live::routes());
    routes
}
